// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Pool
//!
//! Fixed number of worker tasks fed through a bounded queue. When the queue is
//! full the [`Backpressure`] policy decides whether the submitter waits or the
//! job is dropped. A panicking job is caught and counted; its worker keeps
//! running.

use futures_util::{future::BoxFuture, FutureExt};
use serde::Deserialize;
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, warn};

/// Counter of jobs dropped because the pool queue was full.
pub const DROPPED_METRIC: &str = "rabbitmq_consumer_dropped_total";
/// Counter of jobs that panicked on a worker.
pub const JOB_PANICKED_METRIC: &str = "rabbitmq_worker_panicked_total";

pub type Job = BoxFuture<'static, ()>;

/// What to do with a job when the pool queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backpressure {
    /// Wait for room in the queue
    #[default]
    Block,
    /// Drop the job and count it
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    Dropped,
    Closed,
}

pub struct WorkerPool {
    name: String,
    policy: Backpressure,
    capacity: usize,
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks sharing a queue of `capacity` pending jobs.
    /// Both values are raised to at least one.
    pub fn new(name: &str, workers: usize, capacity: usize, policy: Backpressure) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                let pool = name.to_owned();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };

                        if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
                            metrics::counter!(JOB_PANICKED_METRIC, "queue" => pool.clone())
                                .increment(1);
                            error!(
                                pool,
                                worker = id,
                                panic = panic_message(&*panic),
                                "job panicked"
                            );
                        }
                    }
                    debug!(pool, worker = id, "worker finished");
                })
            })
            .collect();

        Self {
            name: name.to_owned(),
            policy,
            capacity,
            tx,
            workers,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    pub async fn submit(&self, job: Job) -> Submitted {
        match self.tx.try_send(job) {
            Ok(()) => Submitted::Queued,
            Err(mpsc::error::TrySendError::Full(job)) => match self.policy {
                Backpressure::Drop => {
                    metrics::counter!(DROPPED_METRIC, "queue" => self.name.clone()).increment(1);
                    warn!(pool = %self.name, "worker pool saturated, dropping message");
                    Submitted::Dropped
                }
                Backpressure::Block => match self.tx.send(job).await {
                    Ok(()) => Submitted::Queued,
                    Err(_) => Submitted::Closed,
                },
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Submitted::Closed,
        }
    }

    /// Closes the queue and waits up to `timeout` for queued and running jobs.
    /// Workers still busy after that are aborted; their count is returned.
    pub async fn shutdown(self, timeout: Duration) -> usize {
        let WorkerPool {
            name, tx, workers, ..
        } = self;
        drop(tx);

        let deadline = Instant::now() + timeout;
        let mut aborted = 0;
        for mut worker in workers {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                worker.abort();
                aborted += 1;
            }
        }

        if aborted > 0 {
            warn!(pool = %name, aborted, "drain timeout elapsed, aborted busy workers");
        }
        aborted
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
