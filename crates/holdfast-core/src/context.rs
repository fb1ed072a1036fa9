// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The transactional execution scope handed to commands.
//!
//! A context lives for one command-execution episode: it wraps a handle
//! and a forked working view, runs the execute/reduce loop, and decides
//! how the view commits — directly, through a lazily created transaction,
//! or deferred to the host transaction's completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::command::InstancePersistenceCommand;
use crate::deadline::Deadline;
use crate::error::{InstancePersistenceError, Result};
use crate::handle::InstanceHandle;
use crate::store::InstanceStore;
use crate::transaction::{CommittableTransaction, Transaction};
use crate::value::{InstanceKey, InstanceKeyState, InstanceValue};
use crate::view::{InstanceKeyView, InstanceState, InstanceValueConsistency, InstanceView};

/// Transactionality and lock-acquisition mode of the outer command, which
/// nested commands may not exceed.
#[derive(Clone, Copy)]
struct CommandMode {
    enlistment_optional: bool,
    acquires_lock: bool,
}

impl CommandMode {
    fn of(command: &dyn InstancePersistenceCommand) -> Self {
        Self {
            enlistment_optional: command.is_transaction_enlistment_optional(),
            acquires_lock: command.automatically_acquires_lock(),
        }
    }
}

/// The execution scope commands run in.
///
/// Providers receive a mutable context from
/// [`StoreProvider::try_command`](crate::StoreProvider::try_command) and
/// use its bind/read/write primitives to record what they persisted;
/// every mutator is gated by state checks (active scope, instance bound,
/// lock held). Calling a mutator outside an active execution scope is a
/// programming error and panics.
pub struct InstancePersistenceContext {
    store: Arc<InstanceStore>,
    handle: Arc<InstanceHandle>,
    view: InstanceView,
    transaction: Option<Transaction>,
    owned_transaction: Option<CommittableTransaction>,
    outer_mode: Option<CommandMode>,
    depth: u32,
    binds_made: bool,
    completed: bool,
}

impl InstancePersistenceContext {
    pub(crate) fn new(
        store: Arc<InstanceStore>,
        handle: Arc<InstanceHandle>,
        transaction: Option<Transaction>,
        mut view: InstanceView,
    ) -> Self {
        // A handle may carry binds its committed view does not (it was
        // created pre-bound); the working view starts from both.
        if view.owner_id().is_none() {
            if let Some(owner) = handle.owner() {
                view.set_owner(owner.owner_id(), owner.lock_token());
            }
        }
        if view.instance_id().is_none() {
            if let Some(instance_id) = handle.instance_id() {
                view.set_instance_id(instance_id);
            }
        }
        let version = handle.instance_version();
        if version >= 0 && !view.is_bound_to_lock() {
            view.set_instance_version(version);
        }
        Self {
            store,
            handle,
            view,
            transaction,
            owned_transaction: None,
            outer_mode: None,
            depth: 0,
            binds_made: false,
            completed: false,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// The working view of this episode.
    pub fn instance_view(&self) -> &InstanceView {
        &self.view
    }

    /// The handle this episode runs under.
    pub fn instance_handle(&self) -> &Arc<InstanceHandle> {
        &self.handle
    }

    /// The instance the episode is bound to, if any.
    pub fn instance_id(&self) -> Option<Uuid> {
        self.view.instance_id()
    }

    /// The transaction this episode runs in, if one exists yet.
    ///
    /// Providers enlist their own participants here when they need to
    /// vote on the outcome.
    pub fn transaction(&self) -> Option<Transaction> {
        self.transaction.clone()
    }

    /// The merged metadata of a key, materializing pending writes on
    /// first read.
    pub fn instance_key_metadata(
        &mut self,
        key: Uuid,
    ) -> Option<&HashMap<String, InstanceValue>> {
        self.view
            .instance_key_mut(&key)
            .map(|kv| &*kv.merged_metadata())
    }

    pub(crate) fn binds_made(&self) -> bool {
        self.binds_made
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn into_view(self) -> InstanceView {
        self.view
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run the outer command of this episode and settle the view.
    pub(crate) async fn outer_execute(
        &mut self,
        command: Arc<dyn InstancePersistenceCommand>,
        deadline: Deadline,
    ) -> Result<InstanceView> {
        assert!(
            self.depth == 0,
            "execute cannot be re-entered at the outer level"
        );
        assert!(
            !self.completed,
            "the persistence context has already completed"
        );
        self.outer_mode = Some(CommandMode::of(command.as_ref()));
        let run = self.execute_core(command, deadline).await;
        self.outer_mode = None;

        match run {
            Ok(()) => {
                if let Some(owned) = self.owned_transaction.take() {
                    // The episode created its own transaction; drive it,
                    // then make the view authoritative.
                    if let Err(error) = owned.commit().await {
                        self.transaction = None;
                        self.completed = true;
                        if self.binds_made {
                            self.handle.free();
                        }
                        return Err(error);
                    }
                    self.transaction = None;
                    self.completed = true;
                    self.handle.commit_view(self.view.clone())
                } else if self.transaction.is_some() {
                    // Host transaction: the view commits when the host
                    // completes. Hand back a stable snapshot meanwhile.
                    let mut snapshot = self.view.clone();
                    snapshot.make_read_only();
                    Ok(snapshot)
                } else {
                    self.completed = true;
                    self.handle.commit_view(self.view.clone())
                }
            }
            Err(error) => {
                if let Some(owned) = self.owned_transaction.take() {
                    owned.rollback().await;
                    self.transaction = None;
                    if self.binds_made {
                        // The rollback leaves the lock state ambiguous.
                        self.handle.free();
                    }
                }
                self.completed = true;
                Err(error)
            }
        }
    }

    /// Execute a nested command from inside a provider's `try_command`.
    ///
    /// A nested command must match its parent's transactionality and
    /// lock-acquisition mode; it may not escalate privilege relative to
    /// its caller.
    ///
    /// # Errors
    ///
    /// [`InstancePersistenceError::InvalidOperation`] on a mode mismatch
    /// or an unsupported irreducible command.
    pub async fn execute(
        &mut self,
        command: Arc<dyn InstancePersistenceCommand>,
        timeout: Duration,
    ) -> Result<()> {
        assert!(
            self.depth > 0,
            "nested execute requires an active outer execute"
        );
        self.execute_core(command, Deadline::after(timeout)).await
    }

    async fn execute_core(
        &mut self,
        command: Arc<dyn InstancePersistenceCommand>,
        deadline: Deadline,
    ) -> Result<()> {
        self.depth += 1;
        let result = self.run_commands(command, deadline).await;
        self.depth -= 1;
        result
    }

    async fn run_commands(
        &mut self,
        command: Arc<dyn InstancePersistenceCommand>,
        deadline: Deadline,
    ) -> Result<()> {
        let provider = self.store.provider();
        let outer = self.outer_mode.expect("outer mode set for the episode");
        let mut stack: Vec<std::vec::IntoIter<Arc<dyn InstancePersistenceCommand>>> = Vec::new();
        let mut next = Some(command);

        loop {
            let command = match next.take() {
                Some(command) => command,
                None => match stack.last_mut() {
                    Some(iterator) => match iterator.next() {
                        Some(command) => command,
                        None => {
                            stack.pop();
                            continue;
                        }
                    },
                    None => break,
                },
            };

            // 1. Lock-acquisition mode is checked before validation.
            if command.automatically_acquires_lock() {
                if !outer.acquires_lock {
                    return Err(InstancePersistenceError::InvalidOperation {
                        reason: format!(
                            "command '{}' acquires the instance lock but its caller does not",
                            command.name()
                        ),
                    });
                }
                if !self.view.is_bound_to_lock() {
                    self.require_transaction();
                    if self.handle.owner().is_some() {
                        self.handle.start_potential_bind();
                        self.binds_made = true;
                    }
                }
            }

            // 2. A nested command cannot demand more transactionality
            //    than its caller declared.
            if !command.is_transaction_enlistment_optional() && outer.enlistment_optional {
                return Err(InstancePersistenceError::InvalidOperation {
                    reason: format!(
                        "command '{}' requires a transaction but its caller declared enlistment optional",
                        command.name()
                    ),
                });
            }

            // 3. Command-specific validation against the working view.
            command.validate(&self.view)?;

            // 4. Provider first; reduce when it declines.
            let remaining = match deadline.remaining() {
                Some(Duration::ZERO) => {
                    return Err(InstancePersistenceError::Timeout {
                        operation: "execute",
                    });
                }
                Some(remaining) => remaining,
                None => Duration::MAX,
            };
            let handled = provider
                .try_command(self, command.as_ref(), remaining)
                .await?;
            if !handled {
                match command.reduce(&self.view) {
                    Some(sub_commands) if !sub_commands.is_empty() => {
                        debug!(command = command.name(), "reducing unsupported command");
                        stack.push(sub_commands.into_iter());
                    }
                    _ => {
                        return Err(InstancePersistenceError::InvalidOperation {
                            reason: format!(
                                "command '{}' is not supported by the provider and cannot be reduced",
                                command.name()
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Ensure the episode has a transaction, creating one lazily so
    /// read-only command sequences avoid transaction overhead entirely.
    fn require_transaction(&mut self) {
        if self.transaction.is_none() {
            let owned = CommittableTransaction::new();
            self.transaction = Some(owned.transaction());
            debug!(transaction = %owned.transaction().id(), "created transaction for write");
            self.owned_transaction = Some(owned);
        }
    }

    // ========================================================================
    // Gates
    // ========================================================================

    fn assert_in_scope(&self) {
        assert!(
            self.depth > 0 && !self.completed,
            "persistence context used outside an active execution scope"
        );
    }

    fn require_owner(&self) -> Result<()> {
        if self.view.is_bound_to_owner() {
            Ok(())
        } else {
            Err(InstancePersistenceError::InvalidOperation {
                reason: "the operation requires a handle bound to an instance owner".to_string(),
            })
        }
    }

    fn require_instance(&self) -> Result<()> {
        if self.view.is_bound_to_instance() {
            Ok(())
        } else {
            Err(InstancePersistenceError::InvalidOperation {
                reason: "the operation requires a handle bound to an instance".to_string(),
            })
        }
    }

    fn require_locked(&self) -> Result<()> {
        self.require_instance()?;
        if self.view.is_bound_to_lock() {
            Ok(())
        } else {
            Err(InstancePersistenceError::InvalidOperation {
                reason: "the operation requires the instance lock".to_string(),
            })
        }
    }

    // ========================================================================
    // Binds
    // ========================================================================

    /// Bind the episode to an owner registration, creating it in the
    /// store registry if needed.
    ///
    /// # Errors
    ///
    /// [`InstancePersistenceError::InstanceOwner`] if the owner id is
    /// registered under a different lock token;
    /// [`InstancePersistenceError::InvalidOperation`] if the view or the
    /// handle is already bound to a different owner.
    pub fn bind_instance_owner(&mut self, owner_id: Uuid, lock_token: Uuid) -> Result<()> {
        self.assert_in_scope();
        if self.view.is_bound_to_owner() {
            return Err(InstancePersistenceError::InvalidOperation {
                reason: "the view is already bound to an instance owner".to_string(),
            });
        }
        self.require_transaction();
        let owner = self.store.get_or_create_owner(owner_id, lock_token)?;
        match self.handle.owner() {
            Some(existing) if Arc::ptr_eq(&existing, &owner) => {}
            Some(_) => {
                return Err(InstancePersistenceError::InvalidOperation {
                    reason: "the handle is bound to a different instance owner".to_string(),
                });
            }
            None => self.handle.bind_owner(owner),
        }
        self.view.set_owner(owner_id, lock_token);
        self.binds_made = true;
        Ok(())
    }

    /// Bind the episode to a specific instance.
    pub fn bind_instance(&mut self, instance_id: Uuid) -> Result<()> {
        self.assert_in_scope();
        self.require_owner()?;
        if self.view.is_bound_to_instance() {
            return Err(InstancePersistenceError::InvalidOperation {
                reason: "the view is already bound to an instance".to_string(),
            });
        }
        match self.handle.instance_id() {
            Some(existing) if existing == instance_id => {}
            Some(_) => {
                return Err(InstancePersistenceError::InvalidOperation {
                    reason: "the handle is bound to a different instance".to_string(),
                });
            }
            None => self.handle.bind_instance(instance_id),
        }
        self.view.set_instance_id(instance_id);
        self.binds_made = true;
        Ok(())
    }

    /// Record that the provider acquired the instance lock at `version`.
    ///
    /// The bind only becomes observable in the owner table when the
    /// episode's transaction commits; a rollback cancels it.
    pub fn bind_acquired_lock(&mut self, version: i64) -> Result<()> {
        self.assert_in_scope();
        self.require_instance()?;
        if self.view.is_bound_to_lock() {
            return Err(InstancePersistenceError::InvalidOperation {
                reason: "the view is already bound to a lock".to_string(),
            });
        }
        if version < 0 {
            return Err(InstancePersistenceError::InvalidOperation {
                reason: format!("'{}' is not a valid lock version", version),
            });
        }
        self.require_transaction();
        self.handle.start_potential_bind();
        self.handle.bind_version(version);
        self.view.set_instance_version(version);
        self.binds_made = true;
        Ok(())
    }

    /// Reclaim a lock this owner already holds in the backing store,
    /// waiting behind every older in-flight bind attempt.
    ///
    /// Lock ownership may be claimed by several competing in-flight
    /// transactions before any commits; ordering by queue position gives
    /// deterministic, livelock-free resolution.
    ///
    /// # Errors
    ///
    /// [`InstancePersistenceError::HandleConflict`] when a bound handle
    /// already holds an equal-or-higher version;
    /// [`InstancePersistenceError::Timeout`] when `timeout` elapses first
    /// (the queue slot is released).
    pub async fn bind_reclaimed_lock(&mut self, version: i64, timeout: Duration) -> Result<()> {
        self.assert_in_scope();
        self.require_instance()?;
        if self.view.is_bound_to_lock() {
            return Err(InstancePersistenceError::InvalidOperation {
                reason: "the view is already bound to a lock".to_string(),
            });
        }
        if version < 0 {
            return Err(InstancePersistenceError::InvalidOperation {
                reason: format!("'{}' is not a valid lock version", version),
            });
        }
        self.require_transaction();
        let receiver = self.handle.initiate_lock_resolution(version)?;

        let deadline = Deadline::after(timeout);
        match deadline.timeout(receiver).await {
            Err(_) => {
                self.handle.cancel_reclaim(InstancePersistenceError::Timeout {
                    operation: "bind_reclaimed_lock",
                });
                Err(InstancePersistenceError::Timeout {
                    operation: "bind_reclaimed_lock",
                })
            }
            Ok(Err(_closed)) => Err(InstancePersistenceError::OperationCanceled {
                reason: "the lock resolution was canceled".to_string(),
            }),
            Ok(Ok(Err(error))) => Err(error),
            Ok(Ok(Ok(()))) => {
                self.handle.bind_version(version);
                self.view.set_instance_version(version);
                self.binds_made = true;
                Ok(())
            }
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Record a full load of the instance.
    ///
    /// Data read without the instance lock is flagged in-doubt.
    pub fn loaded_instance(
        &mut self,
        state: InstanceState,
        data: HashMap<String, InstanceValue>,
        metadata: HashMap<String, InstanceValue>,
        associated_keys: HashMap<Uuid, HashMap<String, InstanceValue>>,
        completed_keys: HashMap<Uuid, HashMap<String, InstanceValue>>,
    ) -> Result<()> {
        self.assert_in_scope();
        self.require_instance()?;
        let consistency = InstanceValueConsistency {
            in_doubt: !self.view.is_bound_to_lock(),
            partial: false,
        };
        self.view.set_instance_state(state);
        self.view.set_instance_data(data, consistency);
        self.view.set_instance_metadata(metadata, consistency);
        for (key, metadata) in associated_keys {
            self.view.insert_instance_key(InstanceKeyView::new(
                key,
                InstanceKeyState::Associated,
                metadata,
                consistency,
            ));
        }
        for (key, metadata) in completed_keys {
            self.view.insert_instance_key(InstanceKeyView::new(
                key,
                InstanceKeyState::Completed,
                metadata,
                consistency,
            ));
        }
        self.view.set_instance_keys_consistency(consistency);
        Ok(())
    }

    /// Record an instance-metadata read; `complete` marks whether the
    /// provider read everything or only a subset.
    pub fn read_instance_metadata(
        &mut self,
        metadata: HashMap<String, InstanceValue>,
        complete: bool,
    ) -> Result<()> {
        self.assert_in_scope();
        self.require_instance()?;
        let consistency = InstanceValueConsistency {
            in_doubt: !self.view.is_bound_to_lock(),
            partial: !complete,
        };
        self.view.set_instance_metadata(metadata, consistency);
        Ok(())
    }

    /// Record an owner-metadata read.
    pub fn read_instance_owner_metadata(
        &mut self,
        metadata: HashMap<String, InstanceValue>,
        complete: bool,
    ) -> Result<()> {
        self.assert_in_scope();
        self.require_owner()?;
        let consistency = InstanceValueConsistency {
            in_doubt: false,
            partial: !complete,
        };
        self.view.set_instance_owner_metadata(metadata, consistency);
        Ok(())
    }

    /// Record a key-metadata read, introducing the key to the view if it
    /// was unknown.
    pub fn read_instance_key_metadata(
        &mut self,
        key: Uuid,
        metadata: HashMap<String, InstanceValue>,
        complete: bool,
    ) -> Result<()> {
        self.assert_in_scope();
        self.require_instance()?;
        let consistency = InstanceValueConsistency {
            in_doubt: !self.view.is_bound_to_lock(),
            partial: !complete,
        };
        match self.view.instance_key_mut(&key) {
            Some(key_view) => key_view.set_metadata(metadata, consistency),
            None => self.view.insert_instance_key(InstanceKeyView::new(
                key,
                InstanceKeyState::Unknown,
                metadata,
                consistency,
            )),
        }
        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Record that the provider persisted the instance state.
    pub fn persisted_instance(&mut self, data: HashMap<String, InstanceValue>) -> Result<()> {
        self.assert_in_scope();
        self.require_locked()?;
        if self.view.instance_state() == InstanceState::Completed {
            return Err(InstancePersistenceError::InvalidOperation {
                reason: "a completed instance cannot be persisted again".to_string(),
            });
        }
        self.require_transaction();
        self.view
            .set_instance_data(data, InstanceValueConsistency::default());
        self.view.set_instance_state(InstanceState::Initialized);
        Ok(())
    }

    /// Record that the instance reached its terminal state.
    pub fn completed_instance(&mut self) -> Result<()> {
        self.assert_in_scope();
        self.require_locked()?;
        self.require_transaction();
        self.view.set_instance_state(InstanceState::Completed);
        Ok(())
    }

    /// Record a single instance-metadata write.
    pub fn wrote_instance_metadata_value(
        &mut self,
        name: impl Into<String>,
        value: InstanceValue,
    ) -> Result<()> {
        self.assert_in_scope();
        self.require_locked()?;
        self.require_transaction();
        self.view.write_instance_metadata_value(name.into(), value);
        Ok(())
    }

    /// Record a single owner-metadata write.
    pub fn wrote_instance_owner_metadata_value(
        &mut self,
        name: impl Into<String>,
        value: InstanceValue,
    ) -> Result<()> {
        self.assert_in_scope();
        self.require_owner()?;
        self.require_transaction();
        self.view
            .write_instance_owner_metadata_value(name.into(), value);
        Ok(())
    }

    /// Record a key association.
    ///
    /// # Errors
    ///
    /// [`InstancePersistenceError::KeyCollision`] if the key is already
    /// known to the view.
    pub fn associated_instance_key(&mut self, key: InstanceKey) -> Result<()> {
        self.assert_in_scope();
        self.require_locked()?;
        if self.view.instance_keys().contains_key(&key.value) {
            return Err(InstancePersistenceError::KeyCollision {
                instance_id: self.view.instance_id(),
                key: key.value,
            });
        }
        self.require_transaction();
        self.view.insert_instance_key(InstanceKeyView::new(
            key.value,
            InstanceKeyState::Associated,
            key.metadata,
            InstanceValueConsistency::default(),
        ));
        Ok(())
    }

    /// Record a key completion.
    ///
    /// # Errors
    ///
    /// [`InstancePersistenceError::KeyComplete`] when the key has already
    /// been completed; [`InstancePersistenceError::KeyNotReady`] when the
    /// key is unknown and the key set is authoritative.
    pub fn completed_instance_key(&mut self, key: Uuid) -> Result<()> {
        self.assert_in_scope();
        self.require_locked()?;
        self.require_transaction();
        let instance_id = self.view.instance_id();
        let keys_partial = self.view.instance_keys_consistency().partial;
        match self.view.instance_key_mut(&key) {
            Some(key_view) => {
                if key_view.state() == InstanceKeyState::Completed {
                    return Err(InstancePersistenceError::KeyComplete { instance_id, key });
                }
                key_view.set_state(InstanceKeyState::Completed);
                Ok(())
            }
            None if keys_partial => {
                // The key set is incomplete; trust the provider.
                self.view.insert_instance_key(InstanceKeyView::new(
                    key,
                    InstanceKeyState::Completed,
                    HashMap::new(),
                    InstanceValueConsistency {
                        in_doubt: false,
                        partial: true,
                    },
                ));
                Ok(())
            }
            None => Err(InstancePersistenceError::KeyNotReady { instance_id, key }),
        }
    }

    /// Record a key disassociation.
    pub fn unassociated_instance_key(&mut self, key: Uuid) -> Result<()> {
        self.assert_in_scope();
        self.require_locked()?;
        self.require_transaction();
        let keys_partial = self.view.instance_keys_consistency().partial;
        if self.view.remove_instance_key(&key).is_none() && !keys_partial {
            return Err(InstancePersistenceError::KeyNotReady {
                instance_id: self.view.instance_id(),
                key,
            });
        }
        Ok(())
    }

    /// Record a single key-metadata write. The write accumulates in the
    /// key's pending overlay and is merged only when read.
    ///
    /// # Errors
    ///
    /// [`InstancePersistenceError::KeyNotReady`] when the key is unknown;
    /// [`InstancePersistenceError::KeyComplete`] when it has completed.
    pub fn wrote_instance_key_metadata_value(
        &mut self,
        key: Uuid,
        name: impl Into<String>,
        value: InstanceValue,
    ) -> Result<()> {
        self.assert_in_scope();
        self.require_locked()?;
        self.require_transaction();
        let instance_id = self.view.instance_id();
        match self.view.instance_key_mut(&key) {
            Some(key_view) => {
                if key_view.state() == InstanceKeyState::Completed {
                    return Err(InstancePersistenceError::KeyComplete { instance_id, key });
                }
                key_view.wrote_metadata_value(name.into(), value);
                Ok(())
            }
            None => Err(InstancePersistenceError::KeyNotReady { instance_id, key }),
        }
    }
}
