//! Download pool bookkeeping: the running set, the FIFO queue and the
//! live concurrency limit.
//!
//! Everything here is synchronous and lives behind one mutex in the
//! manager, so a slot release and the admission it triggers are atomic.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::handle::TaskShared;
use crate::task::{Task, TaskId};

/// A task waiting for a slot.
#[derive(Debug)]
pub(super) struct Queued {
    pub task: Task,
    pub shared: Arc<TaskShared>,
}

/// What a call that can free capacity decided.
#[derive(Debug, Default)]
pub(super) struct Admissions {
    /// Now in the running set; the caller must start them.
    pub started: Vec<Queued>,
    /// Cancelled while queued; the caller must finish them.
    pub dropped: Vec<Queued>,
}

#[derive(Debug)]
pub(super) struct PoolState {
    max: usize,
    running: HashMap<TaskId, Arc<TaskShared>>,
    queue: VecDeque<Queued>,
}

impl PoolState {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            running: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn running_ids(&self) -> Vec<TaskId> {
        self.running.keys().copied().collect()
    }

    /// Queued ids in admission order.
    pub fn queued_ids(&self) -> Vec<TaskId> {
        self.queue.iter().map(|q| q.shared.id).collect()
    }

    /// Running or queued task with this id.
    pub fn get(&self, id: TaskId) -> Option<&Arc<TaskShared>> {
        self.running
            .get(&id)
            .or_else(|| self.queue.iter().find(|q| q.shared.id == id).map(|q| &q.shared))
    }

    pub fn running(&self, id: TaskId) -> Option<&Arc<TaskShared>> {
        self.running.get(&id)
    }

    /// Run `entry` now if a slot is free and nobody is waiting ahead of it,
    /// otherwise queue it. Returns the entry back when it should start, or
    /// its 0-based queue position.
    pub fn submit(&mut self, entry: Queued) -> Result<Queued, usize> {
        if self.queue.is_empty() && self.running.len() < self.max {
            self.running.insert(entry.shared.id, entry.shared.clone());
            return Ok(entry);
        }
        self.queue.push_back(entry);
        Err(self.queue.len() - 1)
    }

    /// Release the slot held by `id` and admit as many queued tasks as the
    /// limit allows.
    pub fn release(&mut self, id: TaskId) -> Admissions {
        self.running.remove(&id);
        self.admit()
    }

    pub fn set_max(&mut self, max: usize) -> Admissions {
        self.max = max.max(1);
        self.admit()
    }

    /// Pop queued tasks into free slots, FIFO. Entries cancelled while
    /// queued are handed back without taking a slot.
    pub fn admit(&mut self) -> Admissions {
        let mut admissions = Admissions::default();
        while self.running.len() < self.max {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            if entry.shared.cancel.is_cancelled() {
                admissions.dropped.push(entry);
                continue;
            }
            self.running.insert(entry.shared.id, entry.shared.clone());
            admissions.started.push(entry);
        }
        admissions
    }

    pub fn remove_queued(&mut self, id: TaskId) -> Option<Queued> {
        let position = self.queue.iter().position(|q| q.shared.id == id)?;
        self.queue.remove(position)
    }

    pub fn drain_queue(&mut self) -> Vec<Queued> {
        self.queue.drain(..).collect()
    }
}
