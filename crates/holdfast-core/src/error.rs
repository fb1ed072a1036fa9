// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for holdfast-core.
//!
//! Runtime races (lock conflicts, timeouts, cancellation) are typed errors
//! the caller is expected to catch and retry. Programming-contract
//! violations (double-bind, mutating a frozen view, re-entrant execute)
//! are not errors at all: they panic, loudly, because no caller can
//! meaningfully recover from them.

use std::fmt;

use uuid::Uuid;

/// Result type using InstancePersistenceError
pub type Result<T> = std::result::Result<T, InstancePersistenceError>;

/// Errors raised by the instance persistence coordination core.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum InstancePersistenceError {
    /// The instance lock is held by a different owner.
    InstanceLocked {
        /// The instance whose lock is held elsewhere.
        instance_id: Uuid,
        /// The owner currently holding the lock, when known.
        owner_id: Option<Uuid>,
    },

    /// A competing handle won the bind race for the same instance.
    ///
    /// The losing handle stays intact; inspect
    /// [`InstanceHandle::conflicting_handle`](crate::InstanceHandle::conflicting_handle)
    /// and retry with a fresh handle.
    HandleConflict {
        /// The contested instance.
        instance_id: Uuid,
    },

    /// The instance lock was revoked while an operation was in flight.
    LockLost {
        /// The instance whose lock was lost.
        instance_id: Uuid,
    },

    /// An instance with this id already exists.
    InstanceCollision {
        /// The colliding instance id.
        instance_id: Uuid,
    },

    /// The key is already associated with this or another instance.
    KeyCollision {
        /// The instance the operation ran against.
        instance_id: Option<Uuid>,
        /// The colliding key.
        key: Uuid,
    },

    /// The key has already been completed.
    KeyComplete {
        /// The instance the key belongs to.
        instance_id: Option<Uuid>,
        /// The completed key.
        key: Uuid,
    },

    /// The key is not known to the instance, or not yet in a usable state.
    KeyNotReady {
        /// The instance the operation ran against.
        instance_id: Option<Uuid>,
        /// The key that was not ready.
        key: Uuid,
    },

    /// The owner identity is invalid, unregistered, or registered with a
    /// different lock token.
    InstanceOwner {
        /// The offending owner id, when known.
        owner_id: Option<Uuid>,
        /// What went wrong.
        reason: String,
    },

    /// The operation requires an instance that is not available.
    InstanceNotReady {
        /// The unavailable instance.
        instance_id: Uuid,
    },

    /// The operation did not complete within the allotted time.
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// The operation was abandoned because the handle was freed.
    OperationCanceled {
        /// Why the operation was canceled.
        reason: String,
    },

    /// The caller violated the execution protocol in a recoverable way
    /// (overlapping commands, nested-command mode mismatch, unsupported
    /// irreducible command).
    InvalidOperation {
        /// What the caller did wrong.
        reason: String,
    },

    /// The transaction grouping the command sequence aborted.
    TransactionAborted {
        /// The aborted transaction.
        transaction_id: Uuid,
    },

    /// The provider reported a command failure it could not express as a
    /// more specific error.
    CommandFailed {
        /// The command that failed.
        command: String,
        /// The provider's reason.
        reason: String,
    },
}

impl InstancePersistenceError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceLocked { .. } => "INSTANCE_LOCKED",
            Self::HandleConflict { .. } => "HANDLE_CONFLICT",
            Self::LockLost { .. } => "LOCK_LOST",
            Self::InstanceCollision { .. } => "INSTANCE_COLLISION",
            Self::KeyCollision { .. } => "KEY_COLLISION",
            Self::KeyComplete { .. } => "KEY_COMPLETE",
            Self::KeyNotReady { .. } => "KEY_NOT_READY",
            Self::InstanceOwner { .. } => "INSTANCE_OWNER",
            Self::InstanceNotReady { .. } => "INSTANCE_NOT_READY",
            Self::Timeout { .. } => "TIMEOUT",
            Self::OperationCanceled { .. } => "OPERATION_CANCELED",
            Self::InvalidOperation { .. } => "INVALID_OPERATION",
            Self::TransactionAborted { .. } => "TRANSACTION_ABORTED",
            Self::CommandFailed { .. } => "COMMAND_FAILED",
        }
    }

    /// Whether retrying the operation (with a fresh handle where needed)
    /// can reasonably be expected to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InstanceLocked { .. }
                | Self::HandleConflict { .. }
                | Self::Timeout { .. }
                | Self::TransactionAborted { .. }
        )
    }
}

impl fmt::Display for InstancePersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceLocked {
                instance_id,
                owner_id,
            } => {
                if let Some(owner) = owner_id {
                    write!(
                        f,
                        "Instance '{}' is locked by owner '{}'",
                        instance_id, owner
                    )
                } else {
                    write!(f, "Instance '{}' is locked by another owner", instance_id)
                }
            }
            Self::HandleConflict { instance_id } => {
                write!(
                    f,
                    "A competing handle already holds the lock for instance '{}'",
                    instance_id
                )
            }
            Self::LockLost { instance_id } => {
                write!(f, "The lock for instance '{}' was lost", instance_id)
            }
            Self::InstanceCollision { instance_id } => {
                write!(f, "Instance '{}' already exists", instance_id)
            }
            Self::KeyCollision { instance_id, key } => match instance_id {
                Some(id) => write!(
                    f,
                    "Key '{}' is already associated for instance '{}'",
                    key, id
                ),
                None => write!(f, "Key '{}' is already associated", key),
            },
            Self::KeyComplete { instance_id, key } => match instance_id {
                Some(id) => write!(
                    f,
                    "Key '{}' of instance '{}' has already been completed",
                    key, id
                ),
                None => write!(f, "Key '{}' has already been completed", key),
            },
            Self::KeyNotReady { instance_id, key } => match instance_id {
                Some(id) => write!(f, "Key '{}' of instance '{}' is not ready", key, id),
                None => write!(f, "Key '{}' is not ready", key),
            },
            Self::InstanceOwner { owner_id, reason } => match owner_id {
                Some(id) => write!(f, "Invalid instance owner '{}': {}", id, reason),
                None => write!(f, "Invalid instance owner: {}", reason),
            },
            Self::InstanceNotReady { instance_id } => {
                write!(f, "Instance '{}' is not ready", instance_id)
            }
            Self::Timeout { operation } => {
                write!(f, "Operation '{}' timed out", operation)
            }
            Self::OperationCanceled { reason } => {
                write!(f, "Operation canceled: {}", reason)
            }
            Self::InvalidOperation { reason } => {
                write!(f, "Invalid operation: {}", reason)
            }
            Self::TransactionAborted { transaction_id } => {
                write!(f, "Transaction '{}' aborted", transaction_id)
            }
            Self::CommandFailed { command, reason } => {
                write!(f, "Command '{}' failed: {}", command, reason)
            }
        }
    }
}

impl std::error::Error for InstancePersistenceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let instance_id = Uuid::new_v4();
        let key = Uuid::new_v4();
        let test_cases = vec![
            (
                InstancePersistenceError::InstanceLocked {
                    instance_id,
                    owner_id: None,
                },
                "INSTANCE_LOCKED",
            ),
            (
                InstancePersistenceError::HandleConflict { instance_id },
                "HANDLE_CONFLICT",
            ),
            (
                InstancePersistenceError::LockLost { instance_id },
                "LOCK_LOST",
            ),
            (
                InstancePersistenceError::KeyCollision {
                    instance_id: Some(instance_id),
                    key,
                },
                "KEY_COLLISION",
            ),
            (
                InstancePersistenceError::Timeout {
                    operation: "execute",
                },
                "TIMEOUT",
            ),
            (
                InstancePersistenceError::OperationCanceled {
                    reason: "handle freed".to_string(),
                },
                "OPERATION_CANCELED",
            ),
            (
                InstancePersistenceError::InvalidOperation {
                    reason: "overlap".to_string(),
                },
                "INVALID_OPERATION",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_display_carries_ids() {
        let instance_id = Uuid::new_v4();
        let err = InstancePersistenceError::InstanceLocked {
            instance_id,
            owner_id: None,
        };
        assert!(err.to_string().contains(&instance_id.to_string()));

        let err = InstancePersistenceError::Timeout {
            operation: "wait_for_events",
        };
        assert_eq!(err.to_string(), "Operation 'wait_for_events' timed out");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(
            InstancePersistenceError::HandleConflict {
                instance_id: Uuid::new_v4()
            }
            .is_retryable()
        );
        assert!(
            !InstancePersistenceError::InvalidOperation {
                reason: "x".to_string()
            }
            .is_retryable()
        );
    }
}
