// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The unit of client interaction with a store.
//!
//! A handle represents a caller's claim to operate on (optionally) a
//! specific instance under (optionally) a specific lock version. It
//! admits at most one in-flight command at a time, participates in the
//! ambient transaction as a volatile enlistment, and owns free/cancel
//! semantics: timeouts and cancellation free the handle, conflicts leave
//! it intact for inspection.
//!
//! # Lifecycle
//!
//! ```text
//! created ──▶ bound to owner ──▶ bound to instance ──▶ bound to lock
//!    │              │                   │                    │
//!    └──────────────┴───────────────────┴────────────────────┴──▶ freed
//! ```
//!
//! Each bind is settable exactly once; a double-set is a programming
//! error and panics. `free()` is reachable from every state and
//! idempotent.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::{Notify, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::context::InstancePersistenceContext;
use crate::deadline::Deadline;
use crate::error::{InstancePersistenceError, Result};
use crate::event::InstancePersistenceEvent;
use crate::owner::{HandleReference, InstanceOwner, apply_actions};
use crate::store::InstanceStore;
use crate::transaction::{Transaction, TransactionParticipant};
use crate::view::InstanceView;

/// A caller's claim on an instance, scoped to one store.
///
/// Created through [`InstanceStore::create_instance_handle`] and
/// released through [`free`](Self::free). All waiting entry points take
/// explicit timeouts; a timed-out or canceled handle is freed and not
/// reusable.
pub struct InstanceHandle {
    store: Arc<InstanceStore>,
    self_weak: Weak<InstanceHandle>,
    state: Mutex<HandleState>,
    /// Signaled when a pending transactional context vacates the handle.
    context_released: Notify,
    /// Signaled when a persistence event becomes ready for this handle.
    event_ready: Notify,
    /// Signaled when the in-flight operation completes.
    operation_drained: Notify,
}

struct HandleState {
    valid: bool,
    cleanup_done: bool,
    need_freed_notification: bool,
    operation_pending: bool,
    id: Option<Uuid>,
    version: i64,
    owner: Option<Arc<InstanceOwner>>,
    conflicting: Option<Weak<InstanceHandle>>,
    pending: Option<PendingTransaction>,
    in_progress_bind: Option<Arc<HandleReference>>,
    ready_events: Vec<InstancePersistenceEvent>,
    last_view: Option<InstanceView>,
}

/// A host transaction this handle is enlisted in, with the context parked
/// between executes of the same transaction.
struct PendingTransaction {
    transaction: Transaction,
    context: Option<Box<InstancePersistenceContext>>,
    binds_made: bool,
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("InstanceHandle")
            .field("instance_id", &state.id)
            .field("version", &state.version)
            .field("valid", &state.valid)
            .field("operation_pending", &state.operation_pending)
            .finish()
    }
}

impl InstanceHandle {
    pub(crate) fn new(
        store: Arc<InstanceStore>,
        owner: Option<Arc<InstanceOwner>>,
        instance_id: Option<Uuid>,
    ) -> Arc<Self> {
        let handle = Arc::new_cyclic(|self_weak| Self {
            store,
            self_weak: self_weak.clone(),
            state: Mutex::new(HandleState {
                valid: true,
                cleanup_done: false,
                need_freed_notification: false,
                operation_pending: false,
                id: instance_id,
                version: -1,
                owner: None,
                conflicting: None,
                pending: None,
                in_progress_bind: None,
                ready_events: Vec::new(),
                last_view: None,
            }),
            context_released: Notify::new(),
            event_ready: Notify::new(),
            operation_drained: Notify::new(),
        });
        if let Some(owner) = owner {
            handle.bind_owner(owner);
        }
        handle
    }

    fn self_arc(&self) -> Arc<InstanceHandle> {
        self.self_weak
            .upgrade()
            .expect("handle is alive while its methods run")
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// The instance this handle is bound to, if any.
    pub fn instance_id(&self) -> Option<Uuid> {
        self.state.lock().unwrap().id
    }

    /// The lock version this handle is bound to, `-1` until bound.
    pub fn instance_version(&self) -> i64 {
        self.state.lock().unwrap().version
    }

    /// The owner this handle is bound to, if any.
    pub fn owner(&self) -> Option<Arc<InstanceOwner>> {
        self.state.lock().unwrap().owner.clone()
    }

    /// Whether the handle is still usable (not freed, not evicted).
    pub fn is_valid(&self) -> bool {
        self.state.lock().unwrap().valid
    }

    /// The handle that won a bind race this handle lost, if one did.
    pub fn conflicting_handle(&self) -> Option<Arc<InstanceHandle>> {
        self.state
            .lock()
            .unwrap()
            .conflicting
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub(crate) fn store(&self) -> &Arc<InstanceStore> {
        &self.store
    }

    // ========================================================================
    // Binds (each settable exactly once)
    // ========================================================================

    pub(crate) fn bind_owner(&self, owner: Arc<InstanceOwner>) {
        {
            let mut state = self.state.lock().unwrap();
            assert!(
                state.owner.is_none(),
                "instance handle is already bound to an owner"
            );
            state.owner = Some(owner.clone());
        }
        // Deliver events that were signaled before we attached.
        for event in owner.attach_handle(&self.self_arc()) {
            self.deliver_event(event);
        }
    }

    pub(crate) fn bind_instance(&self, instance_id: Uuid) {
        let (owner, reference) = {
            let mut state = self.state.lock().unwrap();
            assert!(
                state.id.is_none(),
                "instance handle is already bound to an instance"
            );
            state.id = Some(instance_id);
            (state.owner.clone(), state.in_progress_bind.clone())
        };
        // A queued instance-less bind attempt now targets this instance.
        if let (Some(owner), Some(reference)) = (owner, reference) {
            apply_actions(owner.assign_reference_instance(&reference, instance_id));
        }
    }

    pub(crate) fn bind_version(&self, version: i64) {
        let mut state = self.state.lock().unwrap();
        assert!(version >= 0, "attempted to bind an invalid lock version");
        assert!(
            state.version == -1,
            "instance handle is already bound to a lock version"
        );
        state.version = version;
    }

    /// Reserve a queue slot: this handle may acquire the lock during the
    /// current command, and later reclaims must order behind it.
    pub(crate) fn start_potential_bind(&self) {
        let (owner, instance_id) = {
            let state = self.state.lock().unwrap();
            if state.in_progress_bind.is_some() {
                return;
            }
            (
                state
                    .owner
                    .clone()
                    .expect("potential bind requires an owner"),
                state.id,
            )
        };
        let reference = owner.enqueue_potential_bind(&self.self_arc(), instance_id);
        self.state.lock().unwrap().in_progress_bind = Some(reference);
    }

    /// Enqueue a lock-resolution marker for an optimistic reclaim and
    /// return the receiver its outcome arrives on.
    pub(crate) fn initiate_lock_resolution(
        &self,
        target_version: i64,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let (owner, instance_id, existing) = {
            let state = self.state.lock().unwrap();
            let owner =
                state
                    .owner
                    .clone()
                    .ok_or_else(|| InstancePersistenceError::InvalidOperation {
                        reason: "lock resolution requires a handle bound to an owner".to_string(),
                    })?;
            let instance_id =
                state
                    .id
                    .ok_or_else(|| InstancePersistenceError::InvalidOperation {
                        reason: "lock resolution requires a handle bound to an instance"
                            .to_string(),
                    })?;
            (owner, instance_id, state.in_progress_bind.clone())
        };
        let mut actions = Vec::new();
        let (reference, receiver) = owner.initiate_lock_resolution(
            &self.self_arc(),
            existing.as_ref(),
            instance_id,
            target_version,
            &mut actions,
        );
        self.state.lock().unwrap().in_progress_bind = Some(reference);
        apply_actions(actions);
        Ok(receiver)
    }

    /// Release this handle's queue slot after a failed or abandoned
    /// reclaim.
    pub(crate) fn cancel_reclaim(&self, reason: InstancePersistenceError) {
        let (owner, reference) = {
            let mut state = self.state.lock().unwrap();
            (state.owner.clone(), state.in_progress_bind.take())
        };
        if let (Some(owner), Some(reference)) = (owner, reference) {
            apply_actions(owner.cancel_reference(&reference, reason));
        }
    }

    pub(crate) fn clear_in_progress_bind(&self, reference: &Arc<HandleReference>) {
        let mut state = self.state.lock().unwrap();
        if state
            .in_progress_bind
            .as_ref()
            .is_some_and(|r| Arc::ptr_eq(r, reference))
        {
            state.in_progress_bind = None;
        }
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Commit a working view as this handle's authoritative state,
    /// resolving any in-progress bind against the owner table.
    ///
    /// # Errors
    ///
    /// [`InstancePersistenceError::HandleConflict`] when a competing
    /// handle already holds an equal-or-higher lock version; the handle
    /// stays intact and [`conflicting_handle`](Self::conflicting_handle)
    /// names the winner.
    pub(crate) fn commit_view(&self, mut view: InstanceView) -> Result<InstanceView> {
        view.make_read_only();
        let mut actions = Vec::new();
        let result = {
            let mut state = self.state.lock().unwrap();
            if !state.valid {
                return Err(InstancePersistenceError::OperationCanceled {
                    reason: "the instance handle was freed before commit".to_string(),
                });
            }
            match state.in_progress_bind.take() {
                Some(reference) if state.version >= 0 => {
                    let owner = state
                        .owner
                        .clone()
                        .expect("a bind cannot commit without an owner");
                    let instance_id =
                        state.id.expect("a bind cannot commit without an instance");
                    let version = state.version;
                    // Handle lock is held; the owner lock nests inside it.
                    match owner.try_complete_bind(
                        &self.self_arc(),
                        instance_id,
                        version,
                        &reference,
                        &mut actions,
                    ) {
                        Ok(()) => {
                            state.last_view = Some(view.clone_frozen());
                            Ok(view)
                        }
                        Err(winner) => {
                            state.conflicting = Some(Arc::downgrade(&winner));
                            Err(InstancePersistenceError::HandleConflict { instance_id })
                        }
                    }
                }
                Some(reference) => {
                    // The potential bind never became a lock acquisition;
                    // just release the queue slot.
                    if let Some(owner) = state.owner.clone() {
                        actions.extend(owner.cancel_reference(
                            &reference,
                            InstancePersistenceError::OperationCanceled {
                                reason: "the potential bind was abandoned".to_string(),
                            },
                        ));
                    }
                    state.last_view = Some(view.clone_frozen());
                    Ok(view)
                }
                None => {
                    state.last_view = Some(view.clone_frozen());
                    Ok(view)
                }
            }
        };
        apply_actions(actions);
        result
    }

    // ========================================================================
    // Execution context acquisition
    // ========================================================================

    /// Acquire the execution scope for one command episode.
    ///
    /// Reuses the parked context when `transaction` matches the one
    /// already pending on this handle; otherwise waits for the pending
    /// transaction to vacate.
    ///
    /// # Errors
    ///
    /// - [`InstancePersistenceError::InvalidOperation`] if a command is
    ///   already executing on this handle.
    /// - [`InstancePersistenceError::OperationCanceled`] if the handle
    ///   was freed.
    /// - [`InstancePersistenceError::Timeout`] if the pending transaction
    ///   did not vacate in time; the handle is freed.
    pub(crate) async fn acquire_execution_context(
        &self,
        transaction: Option<Transaction>,
        deadline: Deadline,
    ) -> Result<InstancePersistenceContext> {
        enum Acquired {
            /// Reuse the context parked by an earlier execute in the same
            /// transaction.
            Parked(Box<InstancePersistenceContext>),
            /// Start a fresh context; `enlist` is false when this handle
            /// is already enlisted in the transaction.
            Fresh { enlist: bool },
            /// A different transaction still owns the handle.
            Wait,
        }

        loop {
            let notified = self.context_released.notified();
            tokio::pin!(notified);
            // Register before checking state so a release between the
            // check and the await cannot be missed.
            notified.as_mut().enable();

            let acquired = {
                let mut guard = self.state.lock().unwrap();
                let state = &mut *guard;
                if !state.valid {
                    return Err(InstancePersistenceError::OperationCanceled {
                        reason: "the instance handle was freed".to_string(),
                    });
                }
                if state.operation_pending {
                    return Err(InstancePersistenceError::InvalidOperation {
                        reason: "command execution cannot overlap on an instance handle"
                            .to_string(),
                    });
                }
                let same_transaction = match (state.pending.as_ref(), transaction.as_ref()) {
                    (Some(pending), Some(tx)) => pending.transaction.id() == tx.id(),
                    _ => false,
                };
                if same_transaction {
                    let pending = state.pending.as_mut().expect("pending checked above");
                    match pending.context.take() {
                        Some(context) => {
                            state.operation_pending = true;
                            debug!(transaction = %pending.transaction.id(), "reusing pending execution context");
                            Acquired::Parked(context)
                        }
                        None => {
                            // The earlier episode in this transaction
                            // failed; start over under the existing
                            // enlistment.
                            state.operation_pending = true;
                            Acquired::Fresh { enlist: false }
                        }
                    }
                } else if state.pending.is_some() {
                    Acquired::Wait
                } else {
                    state.operation_pending = true;
                    if let Some(tx) = &transaction {
                        state.pending = Some(PendingTransaction {
                            transaction: tx.clone(),
                            context: None,
                            binds_made: false,
                        });
                    }
                    Acquired::Fresh { enlist: true }
                }
            };

            match acquired {
                Acquired::Parked(context) => return Ok(*context),
                Acquired::Fresh { enlist } => {
                    if enlist {
                        if let Some(tx) = &transaction {
                            let enlisted = tx.enlist_volatile(Arc::new(HandleEnlistment {
                                handle: self.self_weak.clone(),
                            }));
                            if let Err(error) = enlisted {
                                let mut state = self.state.lock().unwrap();
                                state.operation_pending = false;
                                state.pending = None;
                                return Err(error);
                            }
                        }
                    }
                    let view = {
                        let state = self.state.lock().unwrap();
                        state
                            .last_view
                            .as_ref()
                            .map(InstanceView::clone)
                            .unwrap_or_default()
                    };
                    return Ok(InstancePersistenceContext::new(
                        self.store.clone(),
                        self.self_arc(),
                        transaction,
                        view,
                    ));
                }
                Acquired::Wait => {}
            }

            // Another transaction still owns the handle; wait for it to
            // vacate.
            if deadline.timeout(notified).await.is_err() {
                self.free();
                return Err(InstancePersistenceError::Timeout {
                    operation: "acquire_execution_context",
                });
            }
        }
    }

    /// Park the context back on the handle: its host transaction is still
    /// open and a later execute in the same transaction may reuse it.
    pub(crate) fn park_context(&self, context: Box<InstancePersistenceContext>) {
        let binds_made = context.binds_made();
        let deferred_free = {
            let mut state = self.state.lock().unwrap();
            state.operation_pending = false;
            if let Some(pending) = state.pending.as_mut() {
                pending.binds_made |= binds_made;
                pending.context = Some(context);
            }
            state.need_freed_notification
        };
        self.operation_drained.notify_waiters();
        if deferred_free {
            self.free();
        }
    }

    /// Release the handle after an episode that will not be resumed.
    pub(crate) fn release_context(
        &self,
        host_transaction: bool,
        error: Option<&InstancePersistenceError>,
    ) {
        let deferred_free = {
            let mut state = self.state.lock().unwrap();
            state.operation_pending = false;
            if !host_transaction {
                state.pending = None;
            }
            state.need_freed_notification
        };
        self.operation_drained.notify_waiters();
        if !host_transaction {
            self.context_released.notify_waiters();
        }
        match error {
            Some(InstancePersistenceError::Timeout { .. })
            | Some(InstancePersistenceError::OperationCanceled { .. }) => self.free(),
            _ => {}
        }
        if deferred_free {
            self.free();
        }
    }

    // ========================================================================
    // Free
    // ========================================================================

    /// Free the handle.
    ///
    /// Idempotent. Cancels any in-progress bind, unbinds from the owner
    /// table, unregisters event bindings, and notifies the provider
    /// exactly once. Freeing while a command is mid-flight is deferred
    /// until the command's context is released, so the free is never
    /// lost.
    pub fn free(&self) {
        let (owner, instance_id, reference) = {
            let mut state = self.state.lock().unwrap();
            state.valid = false;
            if state.operation_pending {
                state.need_freed_notification = true;
                return;
            }
            if state.cleanup_done {
                return;
            }
            state.cleanup_done = true;
            state.need_freed_notification = false;
            state.pending = None;
            (state.owner.clone(), state.id, state.in_progress_bind.take())
        };

        let this = self.self_arc();
        let mut actions = Vec::new();
        if let Some(owner) = &owner {
            if let Some(reference) = reference {
                actions.extend(owner.cancel_reference(
                    &reference,
                    InstancePersistenceError::OperationCanceled {
                        reason: "the instance handle was freed".to_string(),
                    },
                ));
            }
            if let Some(instance_id) = instance_id {
                actions.extend(owner.unbind_handle(&this, instance_id));
            }
            owner.detach_handle(&this);
        }
        apply_actions(actions);

        self.store.handle_freed(&this);
        debug!(?instance_id, "instance handle freed");

        // Wake anything still waiting on this handle.
        self.context_released.notify_waiters();
        self.event_ready.notify_waiters();
        self.operation_drained.notify_waiters();
    }

    // ========================================================================
    // Eviction and conflicts
    // ========================================================================

    pub(crate) fn set_conflicting_handle(&self, winner: &Arc<InstanceHandle>) {
        self.state.lock().unwrap().conflicting = Some(Arc::downgrade(winner));
    }

    /// A higher-version bind took this handle's lock. The handle becomes
    /// unusable; waiters are woken to observe the cancellation.
    pub(crate) fn on_lock_lost(&self, winner: &Arc<InstanceHandle>) {
        {
            let mut state = self.state.lock().unwrap();
            state.conflicting = Some(Arc::downgrade(winner));
            state.valid = false;
        }
        self.context_released.notify_waiters();
        self.event_ready.notify_waiters();
        self.operation_drained.notify_waiters();
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub(crate) fn deliver_event(&self, event: InstancePersistenceEvent) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.valid {
                return;
            }
            if state.ready_events.contains(&event) {
                return;
            }
            state.ready_events.push(event);
        }
        self.event_ready.notify_waiters();
    }

    pub(crate) fn retract_event(&self, event: &InstancePersistenceEvent) {
        self.state
            .lock()
            .unwrap()
            .ready_events
            .retain(|e| e != event);
    }

    pub(crate) fn ready_events(&self) -> Vec<InstancePersistenceEvent> {
        self.state.lock().unwrap().ready_events.clone()
    }

    pub(crate) fn event_notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.event_ready.notified()
    }

    pub(crate) async fn wait_operation_drained(&self) {
        loop {
            let notified = self.operation_drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.state.lock().unwrap().operation_pending {
                return;
            }
            notified.await;
        }
    }

    // ========================================================================
    // Transaction participant callbacks
    // ========================================================================

    fn on_transaction_commit(&self) {
        let pending = self.state.lock().unwrap().pending.take();
        if let Some(pending) = pending {
            if let Some(context) = pending.context {
                let view = context.into_view();
                if self.commit_view(view).is_err() {
                    // The bind race was lost inside the host transaction;
                    // the handle can no longer represent the lock.
                    self.free();
                }
            }
        }
        self.context_released.notify_waiters();
    }

    fn on_transaction_rollback(&self) {
        let doomed = {
            let mut state = self.state.lock().unwrap();
            let pending = state.pending.take();
            let parked_binds = pending.as_ref().is_some_and(|p| {
                p.binds_made || p.context.as_ref().is_some_and(|c| c.binds_made())
            });
            parked_binds || state.in_progress_bind.is_some()
        };
        if doomed {
            // The rollback leaves the lock state ambiguous.
            self.free();
        }
        self.context_released.notify_waiters();
    }

    fn on_transaction_in_doubt(&self) {
        // Unknown durability: nothing this handle believes can be
        // trusted.
        self.state.lock().unwrap().pending = None;
        self.free();
    }
}

/// Volatile enlistment connecting a handle to its host transaction.
struct HandleEnlistment {
    handle: Weak<InstanceHandle>,
}

#[async_trait]
impl TransactionParticipant for HandleEnlistment {
    async fn prepare(&self) -> bool {
        // Defer while a command is mid-flight, then vote yes.
        if let Some(handle) = self.handle.upgrade() {
            handle.wait_operation_drained().await;
        }
        true
    }

    async fn commit(&self) {
        if let Some(handle) = self.handle.upgrade() {
            handle.on_transaction_commit();
        }
    }

    async fn rollback(&self) {
        if let Some(handle) = self.handle.upgrade() {
            handle.on_transaction_rollback();
        }
    }

    async fn in_doubt(&self) {
        if let Some(handle) = self.handle.upgrade() {
            handle.on_transaction_in_doubt();
        }
    }
}
