//! Background reaping of idle, aged, and over-held connections
//!
//! Each policy runs on its own schedule and calls back into the pool
//! manager. The manager guards every task body with a "task active" flag so
//! runs of one task type never overlap, whatever schedule drives them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::pool::PoolManager;

/// Handles to the background reap tasks of one pool.
pub(crate) struct ReapScheduler {
    shutdown: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

enum ReapTask {
    IdleReap,
    AgedTimeout,
    MaxInUseTime,
}

impl ReapScheduler {
    /// Spawn the reap tasks for `pool`. Tasks hold only a weak reference and
    /// exit when the pool is gone or shutdown is signalled.
    pub(crate) fn start(pool: &Arc<PoolManager>) -> Self {
        let shutdown = Arc::new(Notify::new());
        let config = pool.config();
        let mut tasks = Vec::new();

        tasks.push(spawn_task(
            Arc::downgrade(pool),
            shutdown.clone(),
            config.reap_interval(),
            ReapTask::IdleReap,
        ));
        if config.aged_timeout().is_some() {
            tasks.push(spawn_task(
                Arc::downgrade(pool),
                shutdown.clone(),
                config.reap_interval(),
                ReapTask::AgedTimeout,
            ));
        }
        if let Some(limit) = config.max_in_use_time() {
            let period = (limit / 2).max(Duration::from_secs(1));
            tasks.push(spawn_task(
                Arc::downgrade(pool),
                shutdown.clone(),
                period,
                ReapTask::MaxInUseTime,
            ));
        }

        Self { shutdown, tasks }
    }

    /// Stop every reap task.
    pub(crate) fn shutdown(self) {
        self.shutdown.notify_waiters();
        for task in self.tasks {
            task.abort();
        }
    }
}

fn spawn_task(
    pool: Weak<PoolManager>,
    shutdown: Arc<Notify>,
    period: Duration,
    task: ReapTask,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; skip it
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.notified() => break,
            }
            let Some(pool) = pool.upgrade() else { break };
            match task {
                ReapTask::IdleReap => pool.execute_idle_reap_task().await,
                ReapTask::AgedTimeout => pool.execute_aged_timeout_task().await,
                ReapTask::MaxInUseTime => pool.execute_max_in_use_task().await,
            }
        }
    })
}
