//! Fate-sharing task supervisor
//!
//! The capture loop, the dispatcher and the role front-end live or die
//! together: the first one to stop, for whatever reason, shuts the node
//! down. The first error seen becomes the node's result.

use super::Shutdown;
use crate::protocol::SHUTDOWN_GRACE;
use crate::Error;
use std::future::Future;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Slack on top of the connection grace period before tasks are aborted
const ABORT_SLACK: Duration = Duration::from_secs(1);

type TaskResult = (&'static str, Result<(), Error>);

pub struct Supervisor {
    tasks: JoinSet<TaskResult>,
    shutdown: Shutdown,
}

impl Supervisor {
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            tasks: JoinSet::new(),
            shutdown,
        }
    }

    /// Supervise an async task
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        debug!("Starting {}", name);
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Supervise a blocking task on its own thread
    pub fn spawn_blocking<F>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        debug!("Starting {} (blocking)", name);
        self.tasks.spawn_blocking(move || (name, task()));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for shutdown or the first task to stop, then wind everything down
    pub async fn run(mut self) -> Result<(), Error> {
        let mut failure = None;

        tokio::select! {
            joined = self.tasks.join_next() => {
                if let Some(joined) = joined {
                    let stopped = record(joined, &mut failure);
                    if !self.shutdown.is_triggered() {
                        warn!("{} stopped, shutting the node down", stopped);
                    }
                }
            }
            _ = self.shutdown.wait() => {
                info!("Shutdown requested");
            }
        }
        self.shutdown.trigger();

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(SHUTDOWN_GRACE + ABORT_SLACK, async {
            while let Some(joined) = tasks.join_next().await {
                record(joined, &mut failure);
            }
        })
        .await;

        if drained.is_err() {
            warn!("Aborting {} task(s) still running after grace period", self.tasks.len());
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Log a finished task, keeping the first error; returns its name
fn record(joined: Result<TaskResult, JoinError>, failure: &mut Option<Error>) -> &'static str {
    let (name, result) = match joined {
        Ok(finished) => finished,
        Err(e) if e.is_cancelled() => return "cancelled task",
        Err(e) => ("task", Err(Error::Task(e.to_string()))),
    };

    match result {
        Ok(()) => debug!("{} finished", name),
        Err(e) => {
            error!("{} failed: {}", name, e);
            if failure.is_none() {
                *failure = Some(e);
            }
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkError;

    #[tokio::test]
    async fn test_first_failure_stops_all() {
        let shutdown = Shutdown::new();
        let mut supervisor = Supervisor::new(shutdown.clone());

        let waiter = shutdown.clone();
        supervisor.spawn("front-end", async move {
            waiter.wait().await;
            Ok(())
        });
        supervisor.spawn("dispatcher", async { Err(Error::Link(LinkError::Closed)) });
        assert_eq!(supervisor.len(), 2);

        let result = supervisor.run().await;
        assert!(matches!(result, Err(Error::Link(LinkError::Closed))));
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_clean_exit_also_shares_fate() {
        let shutdown = Shutdown::new();
        let mut supervisor = Supervisor::new(shutdown.clone());

        let waiter = shutdown.clone();
        supervisor.spawn_blocking("capture", move || {
            while !waiter.is_triggered() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        supervisor.spawn("front-end", async { Ok(()) });

        assert!(supervisor.run().await.is_ok());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_external_shutdown() {
        let shutdown = Shutdown::new();
        let mut supervisor = Supervisor::new(shutdown.clone());
        let waiter = shutdown.clone();
        supervisor.spawn("front-end", async move {
            waiter.wait().await;
            Ok(())
        });

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });
        assert!(supervisor.run().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_is_aborted() {
        let shutdown = Shutdown::new();
        let mut supervisor = Supervisor::new(shutdown.clone());
        supervisor.spawn("stuck", std::future::pending());
        shutdown.trigger();

        assert!(supervisor.run().await.is_ok());
    }
}
