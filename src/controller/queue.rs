//! FIFO queue of background tasks for one volume
//!
//! A `put` hands the task straight to the oldest waiting taker when there is
//! one; otherwise it is appended. Closing the queue wakes every waiting
//! taker with `None`.

use crate::common::{BgTask, Error, Result};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<BgTask>,
    waiters: VecDeque<oneshot::Sender<BgTask>>,
    next_num: u64,
    closed: bool,
}

#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding this lock cannot leave the state half-updated.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a task, returning its assigned sequence number.
    pub fn put(&self, mut task: BgTask) -> Result<u64> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::QueueClosed);
        }
        state.next_num += 1;
        task.num = state.next_num;
        task.submitted = Some(Utc::now());
        let num = task.num;

        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(task) {
                Ok(()) => return Ok(num),
                // the taker went away, try the next one
                Err(returned) => task = returned,
            }
        }
        state.queue.push_back(task);
        Ok(num)
    }

    /// Wait for the next task. `None` once the queue is closed.
    pub async fn take(&self) -> Option<BgTask> {
        let rx = {
            let mut state = self.lock();
            if state.closed {
                return None;
            }
            if let Some(task) = state.queue.pop_front() {
                return Some(task);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        rx.await.ok()
    }

    /// Tasks queued but not yet taken
    pub fn list(&self) -> Vec<BgTask> {
        let state = self.lock();
        if state.closed {
            return Vec::new();
        }
        state.queue.iter().cloned().collect()
    }

    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.queue.clear();
        state.waiters.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
