// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deadline accounting shared by the blocking entry points.
//!
//! `Duration::MAX` (or anything that overflows `Instant`) means
//! unbounded: the wait never times out and no timer is armed.

use std::time::{Duration, Instant};

/// A point in time an operation must finish by. `None` is unbounded.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Option<Instant>,
}

/// The deadline passed before the awaited condition held.
#[derive(Debug)]
pub(crate) struct DeadlineElapsed;

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
        }
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.at.is_some_and(|at| at <= Instant::now())
    }

    /// Remaining time; `None` is unbounded, `Some(ZERO)` is expired.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Await a future under this deadline.
    pub(crate) async fn timeout<F>(&self, future: F) -> Result<F::Output, DeadlineElapsed>
    where
        F: std::future::Future,
    {
        match self.remaining() {
            None => Ok(future.await),
            Some(remaining) => tokio::time::timeout(remaining, future)
                .await
                .map_err(|_| DeadlineElapsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_deadline_never_expires() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.is_zero());
        assert!(deadline.remaining().is_none());
    }

    #[test]
    fn test_zero_deadline_is_expired() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(deadline.is_zero());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapses() {
        let deadline = Deadline::after(Duration::from_millis(10));
        let result = deadline.timeout(std::future::pending::<()>()).await;
        assert!(result.is_err());
    }
}
