use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{Result, WorkbenchError};

/// Per-request cancellation handle threaded through every database round-trip.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(WorkbenchError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Races `fut` against cancellation. The losing future is dropped, which
    /// for sqlx releases the connection and rolls back an open transaction.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(WorkbenchError::Cancelled),
            out = fut => out,
        }
    }

    /// Cancels the token when the returned guard is dropped.
    pub fn drop_guard(&self) -> DropGuard {
        DropGuard {
            token: Some(self.clone()),
        }
    }
}

#[derive(Debug)]
pub struct DropGuard {
    token: Option<CancelToken>,
}

impl DropGuard {
    pub fn disarm(mut self) -> CancelToken {
        match self.token.take() {
            Some(token) => token,
            None => CancelToken::new(),
        }
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn run_returns_cancelled_when_token_fires() {
        let token = CancelToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let out: Result<()> = token
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert_eq!(out, Err(WorkbenchError::Cancelled));
    }

    #[tokio::test]
    async fn run_refuses_already_cancelled_token() {
        let token = CancelToken::new();
        token.cancel();
        let out = token.run(async { Ok(1) }).await;
        assert_eq!(out, Err(WorkbenchError::Cancelled));
    }

    #[tokio::test]
    async fn completed_work_wins() {
        let token = CancelToken::new();
        assert_eq!(token.run(async { Ok(7) }).await, Ok(7));
    }

    #[test]
    fn drop_guard_cancels() {
        let token = CancelToken::new();
        {
            let _guard = token.drop_guard();
        }
        assert!(token.is_cancelled());

        let other = CancelToken::new();
        let guard = other.drop_guard();
        let _ = guard.disarm();
        assert!(!other.is_cancelled());
    }
}
