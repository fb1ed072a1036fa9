// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The transaction-enlistment interface consumed from the host transaction
//! coordinator.
//!
//! The core never implements two-phase commit itself; it enlists volatile
//! participants against whatever coordinator the host supplies and reacts
//! to prepare/commit/rollback callbacks. [`CommittableTransaction`] is the
//! minimal owning coordinator used when no host transaction was supplied:
//! the context creates one lazily on the first transactional write and
//! drives it to completion at the end of the outer execute.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{InstancePersistenceError, Result};

/// Terminal outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// All participants prepared and committed.
    Committed,
    /// The transaction rolled back (veto, explicit rollback, or failure).
    Aborted,
    /// The coordinator lost track of the outcome.
    InDoubt,
}

/// A volatile transaction participant.
///
/// Callbacks run in coordinator order: `prepare` on every participant
/// first (any `false` vote aborts), then `commit` or `rollback` on every
/// participant, and only then is the outcome published to
/// [`Transaction::completed`] waiters.
#[async_trait]
pub trait TransactionParticipant: Send + Sync {
    /// Phase one. Return `false` to veto the commit.
    async fn prepare(&self) -> bool {
        true
    }

    /// Phase two, success path.
    async fn commit(&self) {}

    /// Phase two, failure path.
    async fn rollback(&self) {}

    /// The coordinator lost the outcome.
    async fn in_doubt(&self) {}
}

struct TransactionShared {
    id: Uuid,
    // None once the transaction started resolving
    participants: Mutex<Option<Vec<Arc<dyn TransactionParticipant>>>>,
    outcome: watch::Sender<Option<TransactionOutcome>>,
}

/// A cheaply cloneable handle to a transaction.
///
/// Clones share the same underlying transaction; cloning is how the
/// transaction propagates across async boundaries.
#[derive(Clone)]
pub struct Transaction {
    shared: Arc<TransactionShared>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.shared.id)
            .field("outcome", &self.outcome())
            .finish()
    }
}

impl Transaction {
    /// The transaction identity.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Enlist a volatile participant.
    ///
    /// # Errors
    ///
    /// Returns [`InstancePersistenceError::InvalidOperation`] if the
    /// transaction has already started resolving.
    pub fn enlist_volatile(&self, participant: Arc<dyn TransactionParticipant>) -> Result<()> {
        let mut guard = self.shared.participants.lock().unwrap();
        match guard.as_mut() {
            Some(participants) => {
                participants.push(participant);
                Ok(())
            }
            None => Err(InstancePersistenceError::InvalidOperation {
                reason: "cannot enlist in a transaction that is no longer active".to_string(),
            }),
        }
    }

    /// The outcome, if the transaction has completed.
    pub fn outcome(&self) -> Option<TransactionOutcome> {
        *self.shared.outcome.borrow()
    }

    /// Wait for the transaction to complete.
    pub async fn completed(&self) -> TransactionOutcome {
        let mut rx = self.shared.outcome.subscribe();
        // The sender lives in our own Arc, so the channel cannot close
        // while we are waiting; treat a close as in-doubt anyway.
        match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.expect("watch guard checked Some"),
            Err(_) => TransactionOutcome::InDoubt,
        }
    }
}

/// An owning transaction handle that drives completion.
///
/// Created by whoever coordinates the work: the host, or the persistence
/// context when a transactional write occurs with no ambient transaction.
pub struct CommittableTransaction {
    tx: Transaction,
}

impl fmt::Debug for CommittableTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommittableTransaction")
            .field("id", &self.tx.id())
            .finish()
    }
}

impl CommittableTransaction {
    /// Create a new, empty transaction.
    pub fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            tx: Transaction {
                shared: Arc::new(TransactionShared {
                    id: Uuid::new_v4(),
                    participants: Mutex::new(Some(Vec::new())),
                    outcome,
                }),
            },
        }
    }

    /// A cloneable handle for enlistment and propagation.
    pub fn transaction(&self) -> Transaction {
        self.tx.clone()
    }

    /// Drive the transaction to completion.
    ///
    /// # Errors
    ///
    /// Returns [`InstancePersistenceError::TransactionAborted`] if any
    /// participant vetoed during prepare, and
    /// [`InstancePersistenceError::InvalidOperation`] if the transaction
    /// was already resolved.
    pub async fn commit(&self) -> Result<()> {
        let participants = self.take_participants()?;

        // Phase one: any veto aborts.
        for participant in &participants {
            if !participant.prepare().await {
                for participant in &participants {
                    participant.rollback().await;
                }
                self.publish(TransactionOutcome::Aborted);
                return Err(InstancePersistenceError::TransactionAborted {
                    transaction_id: self.tx.id(),
                });
            }
        }

        // Phase two.
        for participant in &participants {
            participant.commit().await;
        }
        self.publish(TransactionOutcome::Committed);
        Ok(())
    }

    /// Roll the transaction back. Idempotent once resolved.
    pub async fn rollback(&self) {
        if let Ok(participants) = self.take_participants() {
            for participant in &participants {
                participant.rollback().await;
            }
            self.publish(TransactionOutcome::Aborted);
        }
    }

    /// Abandon the transaction with an unknown outcome, notifying
    /// participants through their in-doubt callback.
    pub async fn abandon(&self) {
        if let Ok(participants) = self.take_participants() {
            for participant in &participants {
                participant.in_doubt().await;
            }
            self.publish(TransactionOutcome::InDoubt);
        }
    }

    fn take_participants(&self) -> Result<Vec<Arc<dyn TransactionParticipant>>> {
        self.tx
            .shared
            .participants
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| InstancePersistenceError::InvalidOperation {
                reason: "transaction has already been resolved".to_string(),
            })
    }

    fn publish(&self, outcome: TransactionOutcome) {
        self.tx.shared.outcome.send_replace(Some(outcome));
    }
}

impl Default for CommittableTransaction {
    fn default() -> Self {
        Self::new()
    }
}
