//! Cancellation and deadlines for database calls.
//!
//! Every public operation takes a [`Context`]. A context may carry a deadline
//! and can be cancelled from another task; either one aborts the in-flight
//! driver call and surfaces as [`DbError::Cancelled`] or
//! [`DbError::DeadlineExceeded`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DbError, DbResult};

#[derive(Debug, Clone)]
pub struct Context {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            deadline: None,
            token: CancellationToken::new(),
        }
    }

    /// Derive a child whose deadline is `timeout` from now, or the parent's
    /// deadline if that is sooner. Cancelling the parent cancels the child.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            token: self.token.child_token(),
        }
    }

    /// Derive a child that can be cancelled independently of the parent.
    pub fn with_cancel(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Why this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<DbError> {
        if self.token.is_cancelled() {
            return Some(DbError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(DbError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> DbResult<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drive `fut` to completion unless the context finishes first.
    ///
    /// The future is dropped on cancellation, which releases whatever
    /// connection it held.
    pub async fn run<F: Future>(&self, fut: F) -> DbResult<F::Output> {
        self.check()?;
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(DbError::Cancelled),
            _ = expired => Err(DbError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `duration`, waking early if the context finishes.
    pub async fn sleep(&self, duration: Duration) -> DbResult<()> {
        self.run(tokio::time::sleep(duration)).await
    }
}
