//! Subscription bus -- fans validated events out to per-execution
//! observers.
//!
//! Observers are callback triples keyed by execution id. Fan-out is
//! framework-agnostic: callbacks receive the updated record snapshot and
//! never have errors thrown across the boundary. Completed and cancelled
//! records are routed to `on_complete` (cancellation is not a failure);
//! failed records go to `on_error`. Once a terminal event is delivered
//! all observers for that id are dropped, so unsubscribing afterwards is
//! a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::model::{ExecutionStatus, TestExecution};

pub type ObserverFn = Box<dyn Fn(&TestExecution) + Send + Sync>;

struct Observer {
    token: u64,
    on_progress: ObserverFn,
    on_complete: ObserverFn,
    on_error: ObserverFn,
}

impl Observer {
    fn deliver(&self, exec: &TestExecution) {
        match exec.status {
            ExecutionStatus::Failed => (self.on_error)(exec),
            ExecutionStatus::Completed | ExecutionStatus::Cancelled => (self.on_complete)(exec),
            ExecutionStatus::Pending | ExecutionStatus::Running => (self.on_progress)(exec),
        }
    }
}

pub struct SubscriptionBus {
    observers: Mutex<HashMap<Uuid, Vec<Arc<Observer>>>>,
    next_token: AtomicU64,
}

/// Handle returned by `subscribe`; detaches the observer when asked.
/// Unsubscribing twice, or after the execution reached a terminal state,
/// has no effect.
pub struct Subscription {
    bus: Arc<SubscriptionBus>,
    execution_id: Uuid,
    token: u64,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        self.bus.remove(self.execution_id, self.token);
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }
}

impl SubscriptionBus {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register an observer for one execution id. Re-entrant: any number
    /// of observers may watch the same id without interfering.
    pub fn subscribe(
        self: &Arc<Self>,
        execution_id: Uuid,
        on_progress: ObserverFn,
        on_complete: ObserverFn,
        on_error: ObserverFn,
    ) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let observer = Arc::new(Observer {
            token,
            on_progress,
            on_complete,
            on_error,
        });
        self.observers
            .lock()
            .unwrap()
            .entry(execution_id)
            .or_default()
            .push(observer);
        Subscription {
            bus: self.clone(),
            execution_id,
            token,
        }
    }

    /// Deliver an accepted event to every current observer of the record's
    /// id. Terminal deliveries drop the observer list afterwards.
    pub fn notify(&self, exec: &TestExecution) {
        // Snapshot outside the dispatch so a callback may subscribe or
        // unsubscribe without deadlocking.
        let observers: Vec<Arc<Observer>> = {
            let mut map = self.observers.lock().unwrap();
            if exec.status.is_terminal() {
                map.remove(&exec.id).unwrap_or_default()
            } else {
                map.get(&exec.id).cloned().unwrap_or_default()
            }
        };
        for observer in observers {
            observer.deliver(exec);
        }
    }

    /// Deliver the current state to a single just-registered observer.
    pub fn replay_to(&self, subscription: &Subscription, exec: &TestExecution) {
        let observer = {
            let map = self.observers.lock().unwrap();
            map.get(&subscription.execution_id).and_then(|list| {
                list.iter()
                    .find(|o| o.token == subscription.token)
                    .cloned()
            })
        };
        if let Some(observer) = observer {
            observer.deliver(exec);
            if exec.status.is_terminal() {
                self.remove(subscription.execution_id, subscription.token);
            }
        }
    }

    fn remove(&self, execution_id: Uuid, token: u64) {
        let mut map = self.observers.lock().unwrap();
        if let Some(list) = map.get_mut(&execution_id) {
            list.retain(|o| o.token != token);
            if list.is_empty() {
                map.remove(&execution_id);
            }
        }
    }

    #[cfg(test)]
    fn observer_count(&self, execution_id: Uuid) -> usize {
        self.observers
            .lock()
            .unwrap()
            .get(&execution_id)
            .map_or(0, Vec::len)
    }
}

impl Default for SubscriptionBus {
    fn default() -> Self {
        Self::new()
    }
}
