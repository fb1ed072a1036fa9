// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The command vocabulary contract.
//!
//! Commands are opaque to the core: the provider either performs one
//! natively, or declines and the context reduces the command into
//! sub-commands and runs those instead. A minimal provider therefore only
//! needs to support a small primitive set to serve a rich vocabulary.

use std::any::Any;
use std::sync::Arc;

use crate::error::Result;
use crate::view::InstanceView;

/// A persistence command executed through an
/// [`InstancePersistenceContext`](crate::InstancePersistenceContext).
pub trait InstancePersistenceCommand: Send + Sync {
    /// A stable name for diagnostics and provider dispatch.
    fn name(&self) -> &str;

    /// Downcasting hook so providers can recognize concrete command types.
    fn as_any(&self) -> &dyn Any;

    /// Whether this command can run without enlisting in a transaction.
    ///
    /// Read-only commands return `true`; the context then never creates a
    /// transaction on their behalf.
    fn is_transaction_enlistment_optional(&self) -> bool {
        false
    }

    /// Whether executing this command implicitly acquires the instance
    /// lock. Checked before [`validate`](Self::validate); a nested command
    /// may not acquire a lock unless its parent does.
    fn automatically_acquires_lock(&self) -> bool {
        false
    }

    /// Validate the command against the current view before execution.
    fn validate(&self, view: &InstanceView) -> Result<()> {
        let _ = view;
        Ok(())
    }

    /// Expand this command into sub-commands when the provider does not
    /// support it natively. `None` means the command is irreducible.
    fn reduce(&self, view: &InstanceView) -> Option<Vec<Arc<dyn InstancePersistenceCommand>>> {
        let _ = view;
        None
    }
}
