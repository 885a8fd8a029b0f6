//! Concurrent task supervision.
//!
//! The [`TaskSupervisor`] owns every long-running loop of the device. All of
//! them share one [`CancellationToken`]: a task that fails or panics is fatal,
//! so the supervisor cancels the token, waits for the rest to wind down and
//! reports the failure. A task that returns `Ok(())` simply finishes.
//!
//! # Example
//!
//! ```
//! use sensor_link::supervisor::{TaskError, TaskSupervisor};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut supervisor = TaskSupervisor::new(CancellationToken::new());
//! let cancel = supervisor.cancel_token();
//! supervisor.add("worker", async move {
//!     cancel.cancelled().await;
//!     Ok::<_, TaskError>(())
//! });
//! let shutdown = supervisor.cancel_token();
//! shutdown.cancel();
//! supervisor.run(shutdown.cancelled_owned()).await.unwrap();
//! # }
//! ```

use futures::FutureExt;
use log::{error, info};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Error a supervised task can end with.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

/// Runs named tasks until one fails or shutdown is requested.
pub struct TaskSupervisor {
    cancel: CancellationToken,
    tasks: Vec<(String, TaskFuture)>,
}

impl TaskSupervisor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: Vec::new(),
        }
    }

    /// Token every task should observe.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a task. Nothing runs until [`run`](Self::run).
    pub fn add<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.tasks.push((name.into(), Box::pin(task)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task to completion.
    ///
    /// When `shutdown` resolves all tasks are cancelled and the result is
    /// `Ok(())` once they have exited. The first task error or panic cancels
    /// the others and is returned after they have exited.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), SupervisorError> {
        let cancel = self.cancel;
        let mut set = JoinSet::new();
        for (name, task) in self.tasks {
            info!("Starting {}", name);
            set.spawn(async move {
                let outcome = AssertUnwindSafe(task).catch_unwind().await;
                (name, outcome)
            });
        }

        tokio::pin!(shutdown);
        let mut shutting_down = false;
        let mut failure: Option<SupervisorError> = None;

        loop {
            tokio::select! {
                _ = &mut shutdown, if !shutting_down => {
                    info!("Shutdown requested, cancelling {} tasks", set.len());
                    shutting_down = true;
                    cancel.cancel();
                }
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    let error = match joined {
                        Ok((name, Ok(Ok(())))) => {
                            info!("{} exited", name);
                            continue;
                        }
                        Ok((name, Ok(Err(error)))) => {
                            error!("{} failed: {}", name, error);
                            SupervisorError::TaskFailed { name, error }
                        }
                        Ok((name, Err(panic))) => {
                            let message = panic_message(panic.as_ref());
                            error!("{} panicked: {}", name, message);
                            SupervisorError::TaskPanicked { name, message }
                        }
                        Err(e) => {
                            error!("Task could not be joined: {}", e);
                            SupervisorError::Join(e.to_string())
                        }
                    };
                    if failure.is_none() {
                        info!("Cancelling remaining {} tasks", set.len());
                        cancel.cancel();
                        failure = Some(error);
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => {
                info!("All tasks stopped");
                Ok(())
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fatal failure of a supervised task.
#[derive(Debug)]
pub enum SupervisorError {
    /// A task returned an error.
    TaskFailed { name: String, error: TaskError },
    /// A task panicked.
    TaskPanicked { name: String, message: String },
    /// The runtime could not join a task.
    Join(String),
}

impl SupervisorError {
    /// Name of the failed task, if known.
    pub fn task(&self) -> Option<&str> {
        match self {
            Self::TaskFailed { name, .. } | Self::TaskPanicked { name, .. } => Some(name),
            Self::Join(_) => None,
        }
    }
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskFailed { name, error } => write!(f, "task {} failed: {}", name, error),
            Self::TaskPanicked { name, message } => {
                write!(f, "task {} panicked: {}", name, message)
            }
            Self::Join(msg) => write!(f, "join error: {}", msg),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TaskFailed { error, .. } => Some(error.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    /// Task that runs until cancelled and counts how many saw the token.
    async fn until_cancelled(
        cancel: CancellationToken,
        stopped: Arc<AtomicU32>,
    ) -> Result<(), TaskError> {
        cancel.cancelled().await;
        stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn finish_after(delay: Duration) -> Result<(), TaskError> {
        sleep(delay).await;
        Ok(())
    }

    async fn fail_after(delay: Duration, message: &'static str) -> Result<(), TaskError> {
        sleep(delay).await;
        Err(message.into())
    }

    async fn panic_after(delay: Duration) -> Result<(), TaskError> {
        sleep(delay).await;
        panic!("boom")
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_tasks_return_ok() {
        let mut supervisor = TaskSupervisor::new(CancellationToken::new());
        supervisor.add("a", finish_after(Duration::ZERO));
        supervisor.add("b", finish_after(Duration::from_secs(1)));
        assert_eq!(supervisor.len(), 2);

        let result = supervisor.run(std::future::pending()).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_cancels_siblings() {
        let mut supervisor = TaskSupervisor::new(CancellationToken::new());
        let stopped = Arc::new(AtomicU32::new(0));
        supervisor.add("uplink", until_cancelled(supervisor.cancel_token(), stopped.clone()));
        supervisor.add("display", until_cancelled(supervisor.cancel_token(), stopped.clone()));
        supervisor.add("control", fail_after(Duration::from_secs(1), "radio unavailable"));

        let err = supervisor.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::TaskFailed { .. }));
        assert_eq!(err.task(), Some("control"));
        assert!(err.to_string().contains("radio unavailable"));
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_caught() {
        let mut supervisor = TaskSupervisor::new(CancellationToken::new());
        let stopped = Arc::new(AtomicU32::new(0));
        supervisor.add("uplink", until_cancelled(supervisor.cancel_token(), stopped.clone()));
        supervisor.add("faulty", panic_after(Duration::from_millis(10)));

        let err = supervisor.run(std::future::pending()).await.unwrap_err();
        match err {
            SupervisorError::TaskPanicked { name, message } => {
                assert_eq!(name, "faulty");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_clean() {
        let mut supervisor = TaskSupervisor::new(CancellationToken::new());
        let stopped = Arc::new(AtomicU32::new(0));
        for name in ["uplink", "advertise", "display"] {
            supervisor.add(name, until_cancelled(supervisor.cancel_token(), stopped.clone()));
        }

        let result = supervisor.run(sleep(Duration::from_secs(5))).await;
        assert!(result.is_ok());
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_task_does_not_stop_others() {
        let cancel = CancellationToken::new();
        let mut supervisor = TaskSupervisor::new(cancel.clone());
        let stopped = Arc::new(AtomicU32::new(0));
        supervisor.add("exhausted-uplink", finish_after(Duration::ZERO));
        supervisor.add("advertise", until_cancelled(cancel.clone(), stopped.clone()));

        let watcher = cancel.clone();
        let shutdown = async move {
            sleep(Duration::from_secs(60)).await;
            assert!(!watcher.is_cancelled());
        };
        supervisor.run(shutdown).await.unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u32), "unknown panic");
    }
}
