//! Supervisor groups: structured concurrency for the proxy tasks.
//!
//! Every connection owns a group; every task the connection needs runs
//! under it. The first task error (or an explicit `stop`) cancels the
//! whole group, `wait` joins all tasks, runs the teardown hook exactly
//! once, and reports that first error to the parent. Groups nest: a
//! child group is cancelled when its parent is.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Teardown future run exactly once by `wait`, after all tasks have
/// returned. The only place allowed to close the transport and the
/// channels owned by the group's connection.
pub type ExitHook = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Inner {
    name: String,
    token: CancellationToken,
    active: AtomicUsize,
    done: Notify,
    first_err: parking_lot::Mutex<Option<Error>>,
}

impl Inner {
    fn fail(&self, err: Error) {
        {
            let mut slot = self.first_err.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.token.cancel();
    }
}

/// A named collection of tasks bound to one cancellation scope.
pub struct Group {
    inner: Arc<Inner>,
    on_exit: parking_lot::Mutex<Option<ExitHook>>,
}

impl Group {
    /// Create a group, optionally nested under a parent and with a
    /// teardown hook.
    pub fn new(
        name: impl Into<String>,
        parent: Option<&Arc<Group>>,
        on_exit: Option<ExitHook>,
    ) -> Arc<Self> {
        let token = match parent {
            Some(p) => p.inner.token.child_token(),
            None => CancellationToken::new(),
        };
        Arc::new(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                token,
                active: AtomicUsize::new(0),
                done: Notify::new(),
                first_err: parking_lot::Mutex::new(None),
            }),
            on_exit: parking_lot::Mutex::new(on_exit),
        })
    }

    /// Spawn a task under this group. An `Err` return cancels the group
    /// and becomes the group's result if it was first.
    pub fn spawn<F>(&self, task_name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let task_name = task_name.into();
        let inner = Arc::clone(&self.inner);
        inner.active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tracing::debug!("{} task start: {}", inner.name, task_name);
            match task.await {
                Ok(()) => tracing::debug!("{} task end: {}", inner.name, task_name),
                Err(e) => {
                    tracing::info!("{} task exit: {} {}", inner.name, task_name, e);
                    inner.fail(e);
                }
            }
            if inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.done.notify_waiters();
            }
        });
    }

    /// Record an error and begin cancellation.
    pub fn fail(&self, err: Error) {
        self.inner.fail(err);
    }

    /// Begin cancellation without recording an error.
    pub fn stop(&self) {
        self.inner.token.cancel();
    }

    /// Whether the group has started exiting. Cancellation is sticky.
    pub fn is_exiting(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolve when the group starts exiting.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Sleep cooperatively. Returns `false` when the group is exiting.
    pub async fn pause(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.inner.token.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }

    /// Join every task, run the teardown hook, and return the first
    /// task error (if any).
    pub async fn wait(&self) -> Result<()> {
        loop {
            let notified = self.inner.done.notified();
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        let hook = self.on_exit.lock().take();
        if let Some(hook) = hook {
            tracing::debug!("{} group exit hook", self.inner.name);
            hook.await;
        }

        match self.inner.first_err.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop the group and wait it out.
    pub async fn stop_and_wait(&self) -> Result<()> {
        self.stop();
        self.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_error_cancels_siblings() {
        let group = Group::new("test", None, None);

        group.spawn("fails", async { Err(Error::PingTimeout) });
        let g = Arc::clone(&group);
        group.spawn("loops", async move {
            g.cancelled().await;
            Ok(())
        });

        let err = group.wait().await.unwrap_err();
        assert!(matches!(err, Error::PingTimeout));
        assert!(group.is_exiting());
    }

    #[tokio::test]
    async fn test_stop_is_clean() {
        let group = Group::new("test", None, None);
        let g = Arc::clone(&group);
        group.spawn("loops", async move {
            g.cancelled().await;
            Ok(())
        });
        group.stop();
        assert!(group.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_exit_hook_runs_after_tasks() {
        let flag = Arc::new(AtomicBool::new(false));
        let hook_flag = Arc::clone(&flag);
        let group = Group::new(
            "test",
            None,
            Some(Box::pin(async move {
                hook_flag.store(true, Ordering::SeqCst);
            })),
        );
        let g = Arc::clone(&group);
        let task_flag = Arc::clone(&flag);
        group.spawn("task", async move {
            g.cancelled().await;
            // Hook must not have run while a task is still alive.
            assert!(!task_flag.load(Ordering::SeqCst));
            Ok(())
        });
        group.stop();
        group.wait().await.unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_parent_stop_cancels_child_group() {
        let parent = Group::new("parent", None, None);
        let child = Group::new("child", Some(&parent), None);
        let c = Arc::clone(&child);
        child.spawn("loops", async move {
            c.cancelled().await;
            Ok(())
        });
        parent.stop();
        assert!(child.wait().await.is_ok());
        assert!(child.is_exiting());
    }

    #[tokio::test]
    async fn test_pause_cut_short_by_exit() {
        let group = Group::new("test", None, None);
        group.stop();
        assert!(!group.pause(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_tasks_spawned_during_wait_are_joined() {
        let group = Group::new("test", None, None);
        let g = Arc::clone(&group);
        group.spawn("spawner", async move {
            let g2 = Arc::clone(&g);
            g.spawn("late", async move {
                g2.cancelled().await;
                Ok(())
            });
            g.cancelled().await;
            Ok(())
        });
        group.stop();
        assert!(group.wait().await.is_ok());
    }
}
