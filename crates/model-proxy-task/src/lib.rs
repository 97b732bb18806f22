use std::future::Future;

use async_trait::async_trait;
use tokio::task::JoinHandle;

/// Broadcast side of the cooperative shutdown channel.
///
/// Dropping the handle is equivalent to signaling: pending and future
/// `ShutdownSignal::wait` calls resolve either way.
#[derive(Debug)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<()>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = tokio::sync::watch::channel(());
        (Self(sender), ShutdownSignal(receiver))
    }

    pub fn signal(&self) {
        let _ = self.0.send(());
    }

    /// Resolves once every `ShutdownSignal` clone has been dropped,
    /// i.e. once all registered tasks have unwound.
    pub async fn all_closed(&self) {
        self.0.closed().await;
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<()>);

impl ShutdownSignal {
    /// Resolves when the shutdown is requested.
    ///
    /// Resolves immediately when the signal was emitted before the call, so
    /// it is safe to use from `select!` loops entered after the fact.
    pub async fn wait(&mut self) {
        let _ = self.0.changed().await;
    }
}

/// Aborts the running task when dropped.
/// Also see https://github.com/tokio-rs/tokio/issues/1830 for some background.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::task::spawn(future))
    }

    pub async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    /// Joins with a wall-clock cap; `None` when the task outlived the cap.
    ///
    /// The task keeps running on timeout. The caller decides whether letting
    /// it unwind with the runtime is acceptable or whether to abort.
    pub async fn join_timeout(mut self, timeout: std::time::Duration) -> Option<Result<T, tokio::task::JoinError>> {
        match tokio::time::timeout(timeout, &mut self.0).await {
            Ok(result) => Some(result),
            Err(_elapsed) => {
                self.detach();
                None
            }
        }
    }

    /// Immediately abort the task
    pub fn abort(&self) {
        self.0.abort();
    }

    /// Drop without aborting the task
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> From<JoinHandle<T>> for ChildTask<T> {
    fn from(value: JoinHandle<T>) -> Self {
        Self(value)
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// A long-running unit of work which terminates when asked to.
#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

#[track_caller]
pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<T::Output>
where
    T: Task + 'static,
{
    ChildTask(tokio::task::spawn(task.run(shutdown_signal)))
}
