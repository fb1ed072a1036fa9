// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The caller-facing store façade.
//!
//! A store owns the weak-referenced owner registry, routes commands to an
//! injected [`StoreProvider`], and exposes the execute and wait-for-event
//! entry points. The store itself persists nothing: durability is
//! entirely the provider's responsibility.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::command::InstancePersistenceCommand;
use crate::config::Config;
use crate::context::InstancePersistenceContext;
use crate::deadline::Deadline;
use crate::error::{InstancePersistenceError, Result};
use crate::event::InstancePersistenceEvent;
use crate::handle::InstanceHandle;
use crate::owner::{InstanceOwner, apply_actions};
use crate::transaction::Transaction;
use crate::view::InstanceView;

/// The backend provider a store routes commands to.
///
/// A provider either performs a command natively or returns `Ok(false)`
/// to request reduction into sub-commands. The handle hooks let the
/// provider set up and tear down per-handle resources.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Execute a command, or decline it.
    ///
    /// Returning `Ok(false)` means "I do not natively support this
    /// command"; the context then reduces the command and runs the
    /// sub-commands instead.
    async fn try_command(
        &self,
        context: &mut InstancePersistenceContext,
        command: &dyn InstancePersistenceCommand,
        timeout: Duration,
    ) -> Result<bool>;

    /// A handle was created against this store.
    fn on_new_instance_handle(&self, handle: &InstanceHandle) {
        let _ = handle;
    }

    /// A handle was freed. Called exactly once per handle.
    fn on_free_instance_handle(&self, handle: &InstanceHandle) {
        let _ = handle;
    }
}

struct StoreState {
    owners: std::collections::HashMap<Uuid, Weak<InstanceOwner>>,
    /// Keys pending a dead-entry sweep; refilled from the table when
    /// drained so no single call pays a full scan.
    scan_queue: Vec<Uuid>,
}

/// The entry point for executing persistence commands and waiting for
/// store events.
pub struct InstanceStore {
    provider: Arc<dyn StoreProvider>,
    config: Config,
    self_weak: Weak<InstanceStore>,
    state: Mutex<StoreState>,
}

impl fmt::Debug for InstanceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceStore")
            .field("provider", &"...")
            .field("config", &self.config)
            .finish()
    }
}

impl InstanceStore {
    /// Create a store over the given provider with the default
    /// configuration.
    pub fn new(provider: Arc<dyn StoreProvider>) -> Arc<Self> {
        Self::with_config(provider, Config::default())
    }

    /// Create a store with explicit configuration.
    pub fn with_config(provider: Arc<dyn StoreProvider>, config: Config) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            provider,
            config,
            self_weak: self_weak.clone(),
            state: Mutex::new(StoreState {
                owners: std::collections::HashMap::new(),
                scan_queue: Vec::new(),
            }),
        })
    }

    fn self_arc(&self) -> Arc<InstanceStore> {
        self.self_weak
            .upgrade()
            .expect("store is alive while its methods run")
    }

    pub(crate) fn provider(&self) -> Arc<dyn StoreProvider> {
        self.provider.clone()
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// Create an unbound handle.
    pub fn create_instance_handle(&self) -> Arc<InstanceHandle> {
        self.new_handle(None, None)
    }

    /// Create a handle bound to an owner.
    pub fn create_instance_handle_with_owner(
        &self,
        owner: &Arc<InstanceOwner>,
    ) -> Arc<InstanceHandle> {
        self.new_handle(Some(owner.clone()), None)
    }

    /// Create a handle bound to an owner and a specific instance.
    pub fn create_instance_handle_for_instance(
        &self,
        owner: &Arc<InstanceOwner>,
        instance_id: Uuid,
    ) -> Arc<InstanceHandle> {
        self.new_handle(Some(owner.clone()), Some(instance_id))
    }

    fn new_handle(
        &self,
        owner: Option<Arc<InstanceOwner>>,
        instance_id: Option<Uuid>,
    ) -> Arc<InstanceHandle> {
        let handle = InstanceHandle::new(self.self_arc(), owner, instance_id);
        self.provider.on_new_instance_handle(&handle);
        debug!(?instance_id, "instance handle created");
        handle
    }

    pub(crate) fn handle_freed(&self, handle: &Arc<InstanceHandle>) {
        self.provider.on_free_instance_handle(handle);
    }

    // ========================================================================
    // Execute
    // ========================================================================

    /// Execute a command through a handle.
    ///
    /// Passing `Duration::MAX` applies the configured default execute
    /// timeout; command execution is always bounded.
    #[instrument(skip(self, handle, command), fields(command = command.name()))]
    pub async fn execute(
        &self,
        handle: &Arc<InstanceHandle>,
        command: Arc<dyn InstancePersistenceCommand>,
        timeout: Duration,
    ) -> Result<InstanceView> {
        self.execute_inner(handle, command, None, timeout).await
    }

    /// Execute a command inside a host transaction.
    ///
    /// The working view only commits into the owner's bound-handle table
    /// when the host transaction commits; a rollback cancels any pending
    /// lock bind (and frees the handle when that leaves the lock state
    /// ambiguous).
    #[instrument(skip(self, handle, command, transaction), fields(command = command.name(), transaction = %transaction.id()))]
    pub async fn execute_with_transaction(
        &self,
        handle: &Arc<InstanceHandle>,
        command: Arc<dyn InstancePersistenceCommand>,
        transaction: Transaction,
        timeout: Duration,
    ) -> Result<InstanceView> {
        self.execute_inner(handle, command, Some(transaction), timeout)
            .await
    }

    async fn execute_inner(
        &self,
        handle: &Arc<InstanceHandle>,
        command: Arc<dyn InstancePersistenceCommand>,
        transaction: Option<Transaction>,
        timeout: Duration,
    ) -> Result<InstanceView> {
        if !std::ptr::eq(Arc::as_ptr(handle.store()), self) {
            return Err(InstancePersistenceError::InvalidOperation {
                reason: "the handle was created by a different instance store".to_string(),
            });
        }
        let timeout = if timeout == Duration::MAX {
            self.config.default_execute_timeout
        } else {
            timeout
        };
        let deadline = Deadline::after(timeout);
        let host_transaction = transaction.is_some();

        let mut context = handle
            .acquire_execution_context(transaction, deadline)
            .await?;
        let result = context.outer_execute(command, deadline).await;
        match &result {
            Ok(_) if host_transaction && !context.is_completed() => {
                // The host transaction is still open; park the context so
                // a later execute in the same transaction can reuse it.
                handle.park_context(Box::new(context));
            }
            Ok(_) => handle.release_context(host_transaction, None),
            Err(error) => handle.release_context(host_transaction, Some(error)),
        }
        result
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Wait until any of the handle's owner-scoped events are signaled.
    ///
    /// Events are level-triggered: the returned events stay ready until
    /// [`reset_event`](Self::reset_event). A zero timeout fails fast with
    /// [`InstancePersistenceError::Timeout`] without arming a timer.
    /// `Duration::MAX` waits without bound.
    #[instrument(skip(self, handle))]
    pub async fn wait_for_events(
        &self,
        handle: &Arc<InstanceHandle>,
        timeout: Duration,
    ) -> Result<Vec<InstancePersistenceEvent>> {
        if handle.owner().is_none() {
            return Err(InstancePersistenceError::InvalidOperation {
                reason: "the handle is not bound to an instance owner".to_string(),
            });
        }
        let deadline = Deadline::after(timeout);
        loop {
            let notified = handle.event_notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !handle.is_valid() {
                return Err(InstancePersistenceError::OperationCanceled {
                    reason: "the instance handle was freed".to_string(),
                });
            }
            let ready = handle.ready_events();
            if !ready.is_empty() {
                return Ok(ready);
            }
            if deadline.is_zero() {
                // Fail fast: no waiter registered, no timer armed.
                return Err(InstancePersistenceError::Timeout {
                    operation: "wait_for_events",
                });
            }
            if deadline.timeout(notified).await.is_err() {
                return Err(InstancePersistenceError::Timeout {
                    operation: "wait_for_events",
                });
            }
        }
    }

    /// Signal an event for every handle bound to the owner. Idempotent;
    /// handle notification runs outside the store and owner locks.
    #[instrument(skip(self, event, owner), fields(event = event.name(), owner_id = %owner.owner_id()))]
    pub fn signal_event(&self, event: &InstancePersistenceEvent, owner: &Arc<InstanceOwner>) {
        apply_actions(owner.signal_event(event));
    }

    /// Reset a previously signaled event. Idempotent.
    #[instrument(skip(self, event, owner), fields(event = event.name(), owner_id = %owner.owner_id()))]
    pub fn reset_event(&self, event: &InstancePersistenceEvent, owner: &Arc<InstanceOwner>) {
        apply_actions(owner.reset_event(event));
    }

    // ========================================================================
    // Owner registry
    // ========================================================================

    /// Look up or register an owner, pruning a bounded batch of dead
    /// registry entries on the way.
    pub(crate) fn get_or_create_owner(
        &self,
        owner_id: Uuid,
        lock_token: Uuid,
    ) -> Result<Arc<InstanceOwner>> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        // Incremental sweep: amortized pruning instead of a full-table
        // scan per call.
        for _ in 0..self.config.owner_scan_batch {
            match state.scan_queue.pop() {
                Some(key) => {
                    if state
                        .owners
                        .get(&key)
                        .is_some_and(|weak| weak.upgrade().is_none())
                    {
                        state.owners.remove(&key);
                    }
                }
                None => {
                    state.scan_queue = state.owners.keys().copied().collect();
                    break;
                }
            }
        }

        match state.owners.get(&owner_id).and_then(Weak::upgrade) {
            Some(owner) => {
                if owner.lock_token() != lock_token {
                    return Err(InstancePersistenceError::InstanceOwner {
                        owner_id: Some(owner_id),
                        reason: "the owner is registered with a different lock token".to_string(),
                    });
                }
                Ok(owner)
            }
            None => {
                let owner = Arc::new(InstanceOwner::new(owner_id, lock_token));
                state.owners.insert(owner_id, Arc::downgrade(&owner));
                debug!(%owner_id, "instance owner registered");
                Ok(owner)
            }
        }
    }

    /// The owners currently alive in the registry.
    pub fn registered_owners(&self) -> Vec<Arc<InstanceOwner>> {
        let state = self.state.lock().unwrap();
        state
            .owners
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}
