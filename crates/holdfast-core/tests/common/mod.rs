// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for holdfast-core integration tests.
//!
//! Provides an in-memory [`StoreProvider`] and a small command vocabulary
//! exercising the bind/read/write primitives.

#![allow(dead_code)]

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use uuid::Uuid;

use holdfast_core::context::InstancePersistenceContext;
use holdfast_core::error::{InstancePersistenceError, Result};
use holdfast_core::view::InstanceState;
use holdfast_core::{
    InstanceHandle, InstanceKey, InstanceOwner, InstancePersistenceCommand, InstanceStore,
    InstanceValue, InstanceView, StoreProvider,
};

/// Generous timeout for operations expected to finish immediately.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// What the in-memory backend knows about one instance.
#[derive(Debug, Clone, Default)]
pub struct StoredInstance {
    pub version: i64,
    pub data: HashMap<String, InstanceValue>,
    pub completed: bool,
}

#[derive(Default)]
struct MemoryState {
    owners: HashMap<Uuid, Uuid>,
    instances: HashMap<Uuid, StoredInstance>,
}

/// An in-memory provider covering the primitive command set; everything
/// else is declined so the context reduces it.
#[derive(Default)]
pub struct MemoryProvider {
    state: Mutex<MemoryState>,
    pub new_handles: AtomicU32,
    pub freed_handles: AtomicU32,
}

impl MemoryProvider {
    pub fn stored_instance(&self, instance_id: &Uuid) -> Option<StoredInstance> {
        self.state.lock().unwrap().instances.get(instance_id).cloned()
    }
}

#[async_trait]
impl StoreProvider for MemoryProvider {
    async fn try_command(
        &self,
        context: &mut InstancePersistenceContext,
        command: &dyn InstancePersistenceCommand,
        _timeout: Duration,
    ) -> Result<bool> {
        if let Some(command) = command.as_any().downcast_ref::<CreateOwnerCommand>() {
            context.bind_instance_owner(command.owner_id, command.lock_token)?;
            self.state
                .lock()
                .unwrap()
                .owners
                .insert(command.owner_id, command.lock_token);
            return Ok(true);
        }

        if let Some(command) = command.as_any().downcast_ref::<LockInstanceCommand>() {
            if !context.instance_view().is_bound_to_instance() {
                context.bind_instance(command.instance_id)?;
            }
            context.bind_acquired_lock(command.version)?;
            self.state
                .lock()
                .unwrap()
                .instances
                .entry(command.instance_id)
                .or_default()
                .version = command.version;
            return Ok(true);
        }

        if let Some(command) = command.as_any().downcast_ref::<ReclaimLockCommand>() {
            if !context.instance_view().is_bound_to_instance() {
                context.bind_instance(command.instance_id)?;
            }
            context
                .bind_reclaimed_lock(command.version, command.resolution_timeout)
                .await?;
            if let Some(entered) = command.entered.lock().unwrap().take() {
                let _ = entered.send(());
            }
            let release = command.release.lock().unwrap().take();
            if let Some(release) = release {
                let _ = release.await;
            }
            self.state
                .lock()
                .unwrap()
                .instances
                .entry(command.instance_id)
                .or_default()
                .version = command.version;
            return Ok(true);
        }

        if let Some(command) = command.as_any().downcast_ref::<SaveInstanceCommand>() {
            context.persisted_instance(command.data.clone())?;
            let instance_id = context
                .instance_id()
                .expect("save requires a bound instance");
            self.state
                .lock()
                .unwrap()
                .instances
                .entry(instance_id)
                .or_default()
                .data = command.data.clone();
            return Ok(true);
        }

        if command.as_any().downcast_ref::<LoadInstanceCommand>().is_some() {
            let instance_id =
                context
                    .instance_id()
                    .ok_or(InstancePersistenceError::InvalidOperation {
                        reason: "load requires a bound instance".to_string(),
                    })?;
            let stored = self
                .state
                .lock()
                .unwrap()
                .instances
                .get(&instance_id)
                .cloned()
                .unwrap_or_default();
            let state = if stored.completed {
                InstanceState::Completed
            } else if stored.data.is_empty() {
                InstanceState::Uninitialized
            } else {
                InstanceState::Initialized
            };
            context.loaded_instance(
                state,
                stored.data,
                HashMap::new(),
                HashMap::new(),
                HashMap::new(),
            )?;
            return Ok(true);
        }

        if let Some(command) = command.as_any().downcast_ref::<AssociateKeyCommand>() {
            context.associated_instance_key(command.key.clone())?;
            return Ok(true);
        }

        if let Some(command) = command.as_any().downcast_ref::<CompleteKeyCommand>() {
            context.completed_instance_key(command.key)?;
            return Ok(true);
        }

        if let Some(command) = command.as_any().downcast_ref::<WriteMetadataCommand>() {
            context.wrote_instance_metadata_value(command.name.clone(), command.value.clone())?;
            return Ok(true);
        }

        if let Some(command) = command.as_any().downcast_ref::<BlockingCommand>() {
            if let Some(entered) = command.entered.lock().unwrap().take() {
                let _ = entered.send(());
            }
            let release = command.release.lock().unwrap().take();
            if let Some(release) = release {
                let _ = release.await;
            }
            return Ok(true);
        }

        if command
            .as_any()
            .downcast_ref::<NestedEscalationCommand>()
            .is_some()
        {
            // Providers may run sub-commands through the context; this one
            // tries to escalate transactionality and must be rejected.
            context
                .execute(
                    Arc::new(SaveInstanceCommand {
                        data: HashMap::new(),
                    }),
                    Duration::from_secs(1),
                )
                .await?;
            return Ok(true);
        }

        if command
            .as_any()
            .downcast_ref::<AssertNoTransactionCommand>()
            .is_some()
        {
            if context.transaction().is_some() {
                return Err(InstancePersistenceError::CommandFailed {
                    command: "AssertNoTransaction".to_string(),
                    reason: "a transaction was created for a read-only sequence".to_string(),
                });
            }
            return Ok(true);
        }

        if command.as_any().downcast_ref::<ProbeCommand>().is_some() {
            return Ok(true);
        }

        // Anything else: decline and let the context reduce it.
        Ok(false)
    }

    fn on_new_instance_handle(&self, _handle: &InstanceHandle) {
        self.new_handles.fetch_add(1, Ordering::SeqCst);
    }

    fn on_free_instance_handle(&self, _handle: &InstanceHandle) {
        self.freed_handles.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Commands
// ============================================================================

pub struct CreateOwnerCommand {
    pub owner_id: Uuid,
    pub lock_token: Uuid,
}

impl InstancePersistenceCommand for CreateOwnerCommand {
    fn name(&self) -> &str {
        "CreateOwner"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct LockInstanceCommand {
    pub instance_id: Uuid,
    pub version: i64,
}

impl InstancePersistenceCommand for LockInstanceCommand {
    fn name(&self) -> &str {
        "LockInstance"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn automatically_acquires_lock(&self) -> bool {
        true
    }
}

/// Reclaims a lock the owner already holds in the backing store, waiting
/// behind older in-flight bind attempts. The optional channels let tests
/// observe and gate the moment the reclaim resolves.
pub struct ReclaimLockCommand {
    pub instance_id: Uuid,
    pub version: i64,
    pub resolution_timeout: Duration,
    pub entered: Mutex<Option<oneshot::Sender<()>>>,
    pub release: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ReclaimLockCommand {
    pub fn new(instance_id: Uuid, version: i64) -> Self {
        Self {
            instance_id,
            version,
            resolution_timeout: TIMEOUT,
            entered: Mutex::new(None),
            release: Mutex::new(None),
        }
    }

    /// A reclaim that signals `entered` once the lock resolves and then
    /// blocks until `release` fires.
    pub fn gated(
        instance_id: Uuid,
        version: i64,
    ) -> (Self, oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let command = Self {
            instance_id,
            version,
            resolution_timeout: TIMEOUT,
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(Some(release_rx)),
        };
        (command, entered_rx, release_tx)
    }
}

impl InstancePersistenceCommand for ReclaimLockCommand {
    fn name(&self) -> &str {
        "ReclaimLock"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn automatically_acquires_lock(&self) -> bool {
        true
    }
}

pub struct SaveInstanceCommand {
    pub data: HashMap<String, InstanceValue>,
}

impl InstancePersistenceCommand for SaveInstanceCommand {
    fn name(&self) -> &str {
        "SaveInstance"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn validate(&self, view: &InstanceView) -> Result<()> {
        if view.is_bound_to_lock() {
            Ok(())
        } else {
            Err(InstancePersistenceError::InvalidOperation {
                reason: "saving requires the instance lock".to_string(),
            })
        }
    }
}

pub struct LoadInstanceCommand;

impl InstancePersistenceCommand for LoadInstanceCommand {
    fn name(&self) -> &str {
        "LoadInstance"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn is_transaction_enlistment_optional(&self) -> bool {
        true
    }
}

pub struct AssociateKeyCommand {
    pub key: InstanceKey,
}

impl InstancePersistenceCommand for AssociateKeyCommand {
    fn name(&self) -> &str {
        "AssociateKey"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct CompleteKeyCommand {
    pub key: Uuid,
}

impl InstancePersistenceCommand for CompleteKeyCommand {
    fn name(&self) -> &str {
        "CompleteKey"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct WriteMetadataCommand {
    pub name: String,
    pub value: InstanceValue,
}

impl InstancePersistenceCommand for WriteMetadataCommand {
    fn name(&self) -> &str {
        "WriteMetadata"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Not supported natively; reduces to lock-then-save.
pub struct LockAndSaveCommand {
    pub instance_id: Uuid,
    pub version: i64,
    pub data: HashMap<String, InstanceValue>,
}

impl InstancePersistenceCommand for LockAndSaveCommand {
    fn name(&self) -> &str {
        "LockAndSave"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn automatically_acquires_lock(&self) -> bool {
        true
    }
    fn reduce(&self, _view: &InstanceView) -> Option<Vec<Arc<dyn InstancePersistenceCommand>>> {
        Some(vec![
            Arc::new(LockInstanceCommand {
                instance_id: self.instance_id,
                version: self.version,
            }),
            Arc::new(SaveInstanceCommand {
                data: self.data.clone(),
            }),
        ])
    }
}

/// Not supported natively and irreducible.
pub struct UnsupportedCommand;

impl InstancePersistenceCommand for UnsupportedCommand {
    fn name(&self) -> &str {
        "Unsupported"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Declares enlistment optional, then tries to run a transactional
/// sub-command.
pub struct NestedEscalationCommand;

impl InstancePersistenceCommand for NestedEscalationCommand {
    fn name(&self) -> &str {
        "NestedEscalation"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn is_transaction_enlistment_optional(&self) -> bool {
        true
    }
}

/// Signals `entered` when the provider starts it, then blocks until
/// `release` fires. Used to hold a handle's operation slot open.
pub struct BlockingCommand {
    pub entered: Mutex<Option<oneshot::Sender<()>>>,
    pub release: Mutex<Option<oneshot::Receiver<()>>>,
}

impl BlockingCommand {
    pub fn gated() -> (Self, oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let command = Self {
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(Some(release_rx)),
        };
        (command, entered_rx, release_tx)
    }
}

impl InstancePersistenceCommand for BlockingCommand {
    fn name(&self) -> &str {
        "Blocking"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Read-only command that fails if the context created a transaction.
pub struct AssertNoTransactionCommand;

impl InstancePersistenceCommand for AssertNoTransactionCommand {
    fn name(&self) -> &str {
        "AssertNoTransaction"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn is_transaction_enlistment_optional(&self) -> bool {
        true
    }
}

/// Handled no-op.
pub struct ProbeCommand;

impl InstancePersistenceCommand for ProbeCommand {
    fn name(&self) -> &str {
        "Probe"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Test context
// ============================================================================

/// A store over a fresh in-memory provider.
pub struct TestContext {
    pub provider: Arc<MemoryProvider>,
    pub store: Arc<InstanceStore>,
}

impl TestContext {
    pub fn new() -> Self {
        let provider = Arc::new(MemoryProvider::default());
        let store = InstanceStore::new(provider.clone());
        Self { provider, store }
    }

    /// Register a fresh owner and return the handle that created it plus
    /// the owner registration.
    pub async fn create_owner(&self) -> (Arc<InstanceHandle>, Arc<InstanceOwner>) {
        let handle = self.store.create_instance_handle();
        self.store
            .execute(
                &handle,
                Arc::new(CreateOwnerCommand {
                    owner_id: Uuid::new_v4(),
                    lock_token: Uuid::new_v4(),
                }),
                TIMEOUT,
            )
            .await
            .expect("owner creation should succeed");
        let owner = handle.owner().expect("handle bound to owner");
        (handle, owner)
    }

    /// Create a handle under `owner` and try to lock `instance_id` at
    /// `version`. Returns the handle alongside the outcome so conflict
    /// state stays inspectable.
    pub async fn lock_instance(
        &self,
        owner: &Arc<InstanceOwner>,
        instance_id: Uuid,
        version: i64,
    ) -> (Arc<InstanceHandle>, Result<InstanceView>) {
        let handle = self.store.create_instance_handle_with_owner(owner);
        let result = self
            .store
            .execute(
                &handle,
                Arc::new(LockInstanceCommand {
                    instance_id,
                    version,
                }),
                TIMEOUT,
            )
            .await;
        (handle, result)
    }
}

/// Shorthand for a one-entry data map.
pub fn data_with(name: &str, value: i64) -> HashMap<String, InstanceValue> {
    let mut data = HashMap::new();
    data.insert(name.to_string(), InstanceValue::new(value));
    data
}
