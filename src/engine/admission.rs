//! Admission controller -- concurrency limits and the pending queue.
//!
//! A submit first asks for a slot; with none free the execution waits in a
//! per-type queue. Dequeue order is highest priority first, then
//! submission order (stable). Every terminal transition frees a slot and
//! admits as many eligible waiters as capacity then allows.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use uuid::Uuid;

use crate::model::TestType;

/// Concurrency caps. `global` bounds all running executions; `per_type`
/// bounds individual test types. Absent entries are unlimited.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyLimits {
    pub global: Option<usize>,
    pub per_type: HashMap<TestType, usize>,
}

/// Outcome of an admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Still pending; `position` is the 0-based queue position hint.
    Queued { position: usize },
}

#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub id: Uuid,
    pub test_type: TestType,
    pub priority: i32,
    seq: u64,
}

#[derive(Default)]
struct State {
    running_total: usize,
    running_by_type: HashMap<TestType, usize>,
    queues: HashMap<TestType, Vec<QueuedItem>>,
    seq: u64,
}

impl State {
    fn has_capacity(&self, limits: &ConcurrencyLimits, test_type: TestType) -> bool {
        if let Some(global) = limits.global {
            if self.running_total >= global {
                return false;
            }
        }
        if let Some(cap) = limits.per_type.get(&test_type) {
            let running = self.running_by_type.get(&test_type).copied().unwrap_or(0);
            if running >= *cap {
                return false;
            }
        }
        true
    }

    fn occupy(&mut self, test_type: TestType) {
        self.running_total += 1;
        *self.running_by_type.entry(test_type).or_insert(0) += 1;
    }

    fn vacate(&mut self, test_type: TestType) {
        self.running_total = self.running_total.saturating_sub(1);
        if let Some(count) = self.running_by_type.get_mut(&test_type) {
            *count = count.saturating_sub(1);
        }
    }

    /// Items ahead of `item` in its queue: higher priority, or equal
    /// priority submitted earlier.
    fn position_of(&self, item: &QueuedItem) -> usize {
        self.queues
            .get(&item.test_type)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|other| {
                        other.priority > item.priority
                            || (other.priority == item.priority && other.seq < item.seq)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Best queued item that capacity currently allows, across all types.
    fn next_eligible(&self, limits: &ConcurrencyLimits) -> Option<(TestType, usize)> {
        let mut best: Option<(TestType, usize, i32, u64)> = None;
        for (test_type, queue) in &self.queues {
            if !self.has_capacity(limits, *test_type) {
                continue;
            }
            for (index, item) in queue.iter().enumerate() {
                let better = match best {
                    None => true,
                    Some((_, _, priority, seq)) => {
                        item.priority > priority || (item.priority == priority && item.seq < seq)
                    }
                };
                if better {
                    best = Some((*test_type, index, item.priority, item.seq));
                }
            }
        }
        best.map(|(test_type, index, _, _)| (test_type, index))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub running_total: usize,
    pub running_by_type: HashMap<TestType, usize>,
    pub queue_depth: usize,
}

pub struct AdmissionController {
    limits: ConcurrencyLimits,
    state: Mutex<State>,
}

impl AdmissionController {
    pub fn new(limits: ConcurrencyLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(State::default()),
        }
    }

    /// Admit immediately when a slot is free, otherwise queue.
    pub fn try_admit(&self, id: Uuid, test_type: TestType, priority: i32) -> Admission {
        let mut state = self.state.lock().unwrap();
        let queue_empty = state.queues.get(&test_type).map_or(true, Vec::is_empty);
        if queue_empty && state.has_capacity(&self.limits, test_type) {
            state.occupy(test_type);
            return Admission::Admitted;
        }
        state.seq += 1;
        let item = QueuedItem {
            id,
            test_type,
            priority,
            seq: state.seq,
        };
        let position = state.position_of(&item);
        state.queues.entry(test_type).or_default().push(item);
        Admission::Queued { position }
    }

    /// Free the slot held by a finished execution and admit everything now
    /// eligible, in priority-then-FIFO order.
    pub fn release(&self, test_type: TestType) -> Vec<QueuedItem> {
        let mut state = self.state.lock().unwrap();
        state.vacate(test_type);

        let mut admitted = Vec::new();
        while let Some((queued_type, index)) = state.next_eligible(&self.limits) {
            let item = state
                .queues
                .get_mut(&queued_type)
                .expect("queue exists for eligible item")
                .remove(index);
            state.occupy(queued_type);
            admitted.push(item);
        }
        admitted
    }

    /// Drop a not-yet-admitted execution from the queue (cancel while
    /// queued). Returns false when the id is not queued.
    pub fn remove_queued(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().unwrap();
        for queue in state.queues.values_mut() {
            if let Some(index) = queue.iter().position(|item| item.id == id) {
                queue.remove(index);
                return true;
            }
        }
        false
    }

    /// 0-based queue position hint, `None` when not queued.
    pub fn queue_position(&self, id: Uuid) -> Option<usize> {
        let state = self.state.lock().unwrap();
        let item = state
            .queues
            .values()
            .flatten()
            .find(|item| item.id == id)?
            .clone();
        Some(state.position_of(&item))
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.state.lock().unwrap();
        AdmissionStats {
            running_total: state.running_total,
            running_by_type: state.running_by_type.clone(),
            queue_depth: state.queues.values().map(Vec::len).sum(),
        }
    }
}
