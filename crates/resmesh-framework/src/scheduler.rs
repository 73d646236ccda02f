//! Per-group execution lanes.
//!
//! The [`GroupScheduler`] keeps one FIFO queue per active group key. The first
//! task queued on an idle group spawns a worker that drains the queue in
//! submission order and retires once it is empty. Tasks of one group therefore
//! never overlap, while tasks of different groups run concurrently on the
//! tokio runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! let scheduler = GroupScheduler::new(SchedulerOptions::default());
//!
//! scheduler.enqueue("library.book.1", Box::pin(async { /* first */ })).await?;
//! scheduler.enqueue("library.book.1", Box::pin(async { /* runs after first */ })).await?;
//! scheduler.enqueue("library.book.2", Box::pin(async { /* may run concurrently */ })).await?;
//!
//! scheduler.idle().await;
//! ```

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, trace};

use crate::error::SchedulerError;
use crate::handler::BoxFuture;

/// A unit of work queued on a group lane.
pub type Task = BoxFuture<'static, ()>;

/// Behavior when a lane already holds the maximum number of pending tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait until the lane has room.
    #[default]
    Block,
    /// Fail with [`SchedulerError::QueueFull`].
    Reject,
}

/// Backpressure settings of a [`GroupScheduler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Maximum number of groups executing at the same time. `None` is unbounded.
    pub worker_limit: Option<usize>,
    /// Maximum number of pending tasks per group. `None` is unbounded.
    pub max_queue_depth: Option<usize>,
    /// What to do when a lane is full.
    pub overflow: OverflowPolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            worker_limit: None,
            max_queue_depth: None,
            overflow: OverflowPolicy::Block,
        }
    }
}

struct SchedulerInner {
    lanes: Mutex<HashMap<String, VecDeque<Task>>>,
    options: SchedulerOptions,
    permits: Option<Arc<Semaphore>>,
    space: Notify,
    idle: Notify,
}

/// Runs tasks in order per group key and concurrently across group keys.
#[derive(Clone)]
pub struct GroupScheduler {
    inner: Arc<SchedulerInner>,
}

impl GroupScheduler {
    /// Creates a scheduler.
    pub fn new(options: SchedulerOptions) -> Self {
        let permits = options
            .worker_limit
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        Self {
            inner: Arc::new(SchedulerInner {
                lanes: Mutex::new(HashMap::new()),
                options,
                permits,
                space: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// Returns the options the scheduler was created with.
    pub fn options(&self) -> &SchedulerOptions {
        &self.inner.options
    }

    /// Queues `task` on the lane of `group`.
    ///
    /// When the lane is full this waits for room or fails, depending on the
    /// [`OverflowPolicy`].
    pub async fn enqueue(&self, group: impl Into<String>, task: Task) -> Result<(), SchedulerError> {
        let group = group.into();
        let mut task = Some(task);
        loop {
            let notified = self.inner.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.push(&group, &mut task) {
                Ok(()) => return Ok(()),
                Err(err) if self.inner.options.overflow == OverflowPolicy::Reject => return Err(err),
                Err(_) => {
                    trace!(group = %group, "Lane full, waiting for room");
                    notified.await;
                }
            }
        }
    }

    /// Queues `task` without waiting, failing if the lane is full.
    pub fn try_enqueue(&self, group: impl Into<String>, task: Task) -> Result<(), SchedulerError> {
        let group = group.into();
        self.push(&group, &mut Some(task))
    }

    /// Number of groups with a running worker.
    pub fn active_groups(&self) -> usize {
        self.inner.lanes.lock().len()
    }

    /// Waits until every lane has drained.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.lanes.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Takes the task out of `slot` if it could be queued.
    fn push(&self, group: &str, slot: &mut Option<Task>) -> Result<(), SchedulerError> {
        let mut lanes = self.inner.lanes.lock();
        match lanes.get_mut(group) {
            Some(queue) => {
                if let Some(max) = self.inner.options.max_queue_depth
                    && queue.len() >= max
                {
                    return Err(SchedulerError::QueueFull {
                        group: group.to_string(),
                        depth: queue.len(),
                    });
                }
                if let Some(task) = slot.take() {
                    queue.push_back(task);
                }
            }
            None => {
                let Some(task) = slot.take() else {
                    return Ok(());
                };
                lanes.insert(group.to_string(), VecDeque::from([task]));
                drop(lanes);
                debug!(group = %group, "Starting group worker");
                tokio::spawn(run_lane(self.inner.clone(), group.to_string()));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for GroupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupScheduler")
            .field("active_groups", &self.active_groups())
            .field("options", &self.inner.options)
            .finish()
    }
}

/// Drains the lane of `group` until it is empty, then removes it.
async fn run_lane(inner: Arc<SchedulerInner>, group: String) {
    let _permit = match &inner.permits {
        Some(permits) => permits.clone().acquire_owned().await.ok(),
        None => None,
    };

    loop {
        let task = {
            let mut lanes = inner.lanes.lock();
            let Some(queue) = lanes.get_mut(&group) else {
                break;
            };
            match queue.pop_front() {
                Some(task) => task,
                None => {
                    lanes.remove(&group);
                    let drained = lanes.is_empty();
                    drop(lanes);
                    debug!(group = %group, "Group worker retired");
                    if drained {
                        inner.idle.notify_waiters();
                    }
                    break;
                }
            }
        };
        inner.space.notify_waiters();

        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            error!(group = %group, "Task panicked on group lane");
        }
    }
}
