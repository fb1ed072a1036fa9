// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-owner arbitration of instance locks.
//!
//! An owner tracks three things under a single mutex: which handle is
//! bound to each instance (ground truth of lock ownership), the FIFO
//! queues of in-flight bind attempts, and the signaled-event registry.
//! Bind conflicts are resolved by lock version; pending reclaims are
//! resolved strictly in enqueue order so that competing in-flight
//! transactions converge deterministically and without livelock.
//!
//! Lock order is always handle-lock then owner-lock. Anything that wakes
//! a waiter or touches a *different* handle is collected as a
//! [`ResolutionAction`] under the owner lock and applied only after every
//! lock has been released.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::{InstancePersistenceError, Result};
use crate::event::InstancePersistenceEvent;
use crate::handle::InstanceHandle;

/// A registered owner identity scoped to one [`InstanceStore`](crate::InstanceStore).
///
/// Owners are held weakly by the store and stay alive exactly as long as
/// some handle references them.
pub struct InstanceOwner {
    owner_id: Uuid,
    lock_token: Uuid,
    state: Mutex<OwnerState>,
}

impl fmt::Debug for InstanceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceOwner")
            .field("owner_id", &self.owner_id)
            .field("lock_token", &self.lock_token)
            .finish()
    }
}

struct OwnerState {
    /// instance id -> the one handle holding (or bootstrapping) its lock
    bound_handles: HashMap<Uuid, BoundHandle>,
    /// bind attempts not yet tied to an instance, FIFO
    in_progress_handles: VecDeque<Arc<HandleReference>>,
    /// per-instance bind attempts, each queue sorted by sequence
    in_progress_per_instance: HashMap<Uuid, VecDeque<Arc<HandleReference>>>,
    /// event name -> signaled flag
    events: HashMap<InstancePersistenceEvent, bool>,
    /// handles attached to this owner for event delivery
    attached_handles: Vec<Weak<InstanceHandle>>,
    next_seq: u64,
}

struct BoundHandle {
    version: i64,
    handle: Weak<InstanceHandle>,
}

/// A queue-position token for an in-flight bind attempt.
///
/// A plain reference marks "this handle may bind soon" and orders later
/// reclaims behind it. Upgrading it with a waiter turns it into a
/// lock-resolution marker that completes once it is the oldest pending
/// request for its instance.
pub(crate) struct HandleReference {
    seq: u64,
    inner: Mutex<ReferenceInner>,
}

struct ReferenceInner {
    handle: Weak<InstanceHandle>,
    instance_id: Option<Uuid>,
    target_version: i64,
    /// Present while an unresolved reclaim is waiting on this reference.
    waiter: Option<oneshot::Sender<Result<()>>>,
}

impl HandleReference {
    fn handle(&self) -> Option<Arc<InstanceHandle>> {
        self.inner.lock().unwrap().handle.upgrade()
    }
}

/// Deferred effects collected under the owner lock.
pub(crate) enum ResolutionAction {
    /// Wake a reclaim waiter with its outcome.
    NotifyMarker {
        waiter: oneshot::Sender<Result<()>>,
        result: Result<()>,
    },
    /// Clear a handle's in-progress bind after its marker failed.
    ClearInProgressBind {
        handle: Arc<InstanceHandle>,
        reference: Arc<HandleReference>,
    },
    /// A bound handle was evicted by a higher-version bind.
    LockLost {
        handle: Arc<InstanceHandle>,
        winner: Arc<InstanceHandle>,
    },
    /// A reclaiming handle lost against the current bound handle.
    SetConflicting {
        handle: Arc<InstanceHandle>,
        winner: Arc<InstanceHandle>,
    },
    /// Deliver a signaled event to an attached handle.
    DeliverEvent {
        handle: Arc<InstanceHandle>,
        event: InstancePersistenceEvent,
    },
    /// Remove a reset event from an attached handle.
    ClearEvent {
        handle: Arc<InstanceHandle>,
        event: InstancePersistenceEvent,
    },
}

/// Apply deferred effects. Must be called with no owner or handle lock
/// held.
pub(crate) fn apply_actions(actions: Vec<ResolutionAction>) {
    for action in actions {
        match action {
            ResolutionAction::NotifyMarker { waiter, result } => {
                // The waiting side may have timed out and gone away.
                let _ = waiter.send(result);
            }
            ResolutionAction::ClearInProgressBind { handle, reference } => {
                handle.clear_in_progress_bind(&reference);
            }
            ResolutionAction::LockLost { handle, winner } => {
                handle.on_lock_lost(&winner);
            }
            ResolutionAction::SetConflicting { handle, winner } => {
                handle.set_conflicting_handle(&winner);
            }
            ResolutionAction::DeliverEvent { handle, event } => {
                handle.deliver_event(event);
            }
            ResolutionAction::ClearEvent { handle, event } => {
                handle.retract_event(&event);
            }
        }
    }
}

impl InstanceOwner {
    pub(crate) fn new(owner_id: Uuid, lock_token: Uuid) -> Self {
        Self {
            owner_id,
            lock_token,
            state: Mutex::new(OwnerState {
                bound_handles: HashMap::new(),
                in_progress_handles: VecDeque::new(),
                in_progress_per_instance: HashMap::new(),
                events: HashMap::new(),
                attached_handles: Vec::new(),
                next_seq: 0,
            }),
        }
    }

    /// The owner identity.
    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    /// The opaque token proving ownership of this owner registration.
    pub fn lock_token(&self) -> Uuid {
        self.lock_token
    }

    // ========================================================================
    // Handle attachment and events
    // ========================================================================

    /// Attach a handle for event delivery; returns the events that are
    /// already signaled so the caller can deliver them immediately.
    pub(crate) fn attach_handle(
        &self,
        handle: &Arc<InstanceHandle>,
    ) -> Vec<InstancePersistenceEvent> {
        let mut state = self.state.lock().unwrap();
        state.attached_handles.push(Arc::downgrade(handle));
        state
            .events
            .iter()
            .filter(|(_, signaled)| **signaled)
            .map(|(event, _)| event.clone())
            .collect()
    }

    pub(crate) fn detach_handle(&self, handle: &Arc<InstanceHandle>) {
        let mut state = self.state.lock().unwrap();
        state
            .attached_handles
            .retain(|weak| weak.upgrade().is_some_and(|h| !Arc::ptr_eq(&h, handle)));
    }

    pub(crate) fn signal_event(&self, event: &InstancePersistenceEvent) -> Vec<ResolutionAction> {
        let mut state = self.state.lock().unwrap();
        state.events.insert(event.clone(), true);
        Self::live_attached(&mut state)
            .into_iter()
            .map(|handle| ResolutionAction::DeliverEvent {
                handle,
                event: event.clone(),
            })
            .collect()
    }

    pub(crate) fn reset_event(&self, event: &InstancePersistenceEvent) -> Vec<ResolutionAction> {
        let mut state = self.state.lock().unwrap();
        state.events.insert(event.clone(), false);
        Self::live_attached(&mut state)
            .into_iter()
            .map(|handle| ResolutionAction::ClearEvent {
                handle,
                event: event.clone(),
            })
            .collect()
    }

    fn live_attached(state: &mut OwnerState) -> Vec<Arc<InstanceHandle>> {
        let mut live = Vec::with_capacity(state.attached_handles.len());
        state.attached_handles.retain(|weak| match weak.upgrade() {
            Some(handle) => {
                live.push(handle);
                true
            }
            None => false,
        });
        live
    }

    // ========================================================================
    // Bind queues
    // ========================================================================

    /// Enqueue a potential-bind reference for a handle that may acquire
    /// the lock during the current command.
    pub(crate) fn enqueue_potential_bind(
        &self,
        handle: &Arc<InstanceHandle>,
        instance_id: Option<Uuid>,
    ) -> Arc<HandleReference> {
        let mut state = self.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        let reference = Arc::new(HandleReference {
            seq,
            inner: Mutex::new(ReferenceInner {
                handle: Arc::downgrade(handle),
                instance_id,
                target_version: -1,
                waiter: None,
            }),
        });
        match instance_id {
            Some(id) => Self::insert_sorted(
                state.in_progress_per_instance.entry(id).or_default(),
                reference.clone(),
            ),
            None => state.in_progress_handles.push_back(reference.clone()),
        }
        reference
    }

    /// Tie a previously instance-less reference to an instance, keeping
    /// its queue position by sequence number.
    pub(crate) fn assign_reference_instance(
        &self,
        reference: &Arc<HandleReference>,
        instance_id: Uuid,
    ) -> Vec<ResolutionAction> {
        let mut actions = Vec::new();
        let mut state = self.state.lock().unwrap();
        Self::remove_reference(&mut state, reference);
        reference.inner.lock().unwrap().instance_id = Some(instance_id);
        Self::insert_sorted(
            state.in_progress_per_instance.entry(instance_id).or_default(),
            reference.clone(),
        );
        // The global queue shrank, which may unblock other instances.
        Self::check_oldest_references(&mut state, &mut actions);
        actions
    }

    /// Enqueue (or upgrade an existing reference into) a lock-resolution
    /// marker. The returned receiver fires when the marker becomes the
    /// oldest pending request for the instance and version arbitration
    /// has run.
    pub(crate) fn initiate_lock_resolution(
        &self,
        handle: &Arc<InstanceHandle>,
        existing: Option<&Arc<HandleReference>>,
        instance_id: Uuid,
        target_version: i64,
        actions: &mut Vec<ResolutionAction>,
    ) -> (Arc<HandleReference>, oneshot::Receiver<Result<()>>) {
        let (waiter, receiver) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        let reference = match existing {
            Some(reference) => {
                // Upgrade in place, preserving the queue position the
                // reference already earned.
                {
                    let mut inner = reference.inner.lock().unwrap();
                    inner.target_version = target_version;
                    inner.waiter = Some(waiter);
                    if inner.instance_id != Some(instance_id) {
                        inner.instance_id = Some(instance_id);
                    }
                }
                Self::remove_reference(&mut state, reference);
                Self::insert_sorted(
                    state.in_progress_per_instance.entry(instance_id).or_default(),
                    reference.clone(),
                );
                reference.clone()
            }
            None => {
                let seq = state.next_seq;
                state.next_seq += 1;
                let reference = Arc::new(HandleReference {
                    seq,
                    inner: Mutex::new(ReferenceInner {
                        handle: Arc::downgrade(handle),
                        instance_id: Some(instance_id),
                        target_version,
                        waiter: Some(waiter),
                    }),
                });
                Self::insert_sorted(
                    state.in_progress_per_instance.entry(instance_id).or_default(),
                    reference.clone(),
                );
                reference
            }
        };
        // The marker may already be the oldest pending request.
        Self::check_oldest_references(&mut state, actions);
        (reference, receiver)
    }

    /// Drop a reference from whichever queue holds it, canceling any
    /// unresolved marker wait.
    pub(crate) fn cancel_reference(
        &self,
        reference: &Arc<HandleReference>,
        reason: InstancePersistenceError,
    ) -> Vec<ResolutionAction> {
        let mut actions = Vec::new();
        let mut state = self.state.lock().unwrap();
        Self::remove_reference(&mut state, reference);
        if let Some(waiter) = reference.inner.lock().unwrap().waiter.take() {
            actions.push(ResolutionAction::NotifyMarker {
                waiter,
                result: Err(reason),
            });
        }
        Self::check_oldest_references(&mut state, &mut actions);
        actions
    }

    fn insert_sorted(queue: &mut VecDeque<Arc<HandleReference>>, reference: Arc<HandleReference>) {
        let position = queue.partition_point(|r| r.seq < reference.seq);
        queue.insert(position, reference);
    }

    fn remove_reference(state: &mut OwnerState, reference: &Arc<HandleReference>) {
        if let Some(position) = state
            .in_progress_handles
            .iter()
            .position(|r| Arc::ptr_eq(r, reference))
        {
            state.in_progress_handles.remove(position);
            return;
        }
        let mut emptied = None;
        if let Some(instance_id) = reference.inner.lock().unwrap().instance_id {
            if let Some(queue) = state.in_progress_per_instance.get_mut(&instance_id) {
                if let Some(position) = queue.iter().position(|r| Arc::ptr_eq(r, reference)) {
                    queue.remove(position);
                }
                if queue.is_empty() {
                    emptied = Some(instance_id);
                }
            }
        }
        if let Some(instance_id) = emptied {
            state.in_progress_per_instance.remove(&instance_id);
        }
    }

    // ========================================================================
    // Bind arbitration
    // ========================================================================

    /// Complete a handle's bind at commit time.
    ///
    /// Version rules are a fixed contract: with an existing bound handle,
    /// both-zero replaces silently (no real lock yet), a strictly higher
    /// version wins and evicts the loser, an equal positive version is a
    /// fatal double-bind, and a lower version loses — `Err` carries the
    /// winning handle and the caller raises the conflict.
    ///
    /// Called with the committing handle's lock held (handle-lock before
    /// owner-lock); deferred effects go into `actions`.
    pub(crate) fn try_complete_bind(
        &self,
        handle: &Arc<InstanceHandle>,
        instance_id: Uuid,
        version: i64,
        reference: &Arc<HandleReference>,
        actions: &mut Vec<ResolutionAction>,
    ) -> std::result::Result<(), Arc<InstanceHandle>> {
        assert!(version >= 0, "attempted to bind an invalid lock version");
        let mut state = self.state.lock().unwrap();
        Self::remove_reference(&mut state, reference);

        let existing = state
            .bound_handles
            .get(&instance_id)
            .and_then(|bound| bound.handle.upgrade().map(|h| (bound.version, h)));

        let result = match existing {
            None => {
                state.bound_handles.insert(
                    instance_id,
                    BoundHandle {
                        version,
                        handle: Arc::downgrade(handle),
                    },
                );
                debug!(%instance_id, version, "lock bound");
                Ok(())
            }
            Some((existing_version, existing_handle)) => {
                assert!(
                    version != existing_version || version == 0,
                    "instance {} bound at lock version {} twice; a restored \
                     backup is replaying a version it already issued",
                    instance_id,
                    version
                );
                if version > existing_version || (version == 0 && existing_version == 0) {
                    state.bound_handles.insert(
                        instance_id,
                        BoundHandle {
                            version,
                            handle: Arc::downgrade(handle),
                        },
                    );
                    if existing_version > 0 {
                        actions.push(ResolutionAction::LockLost {
                            handle: existing_handle,
                            winner: handle.clone(),
                        });
                    }
                    debug!(%instance_id, version, existing_version, "lock rebound");
                    Ok(())
                } else {
                    debug!(%instance_id, version, existing_version, "bind lost to higher version");
                    Err(existing_handle)
                }
            }
        };

        Self::check_oldest_references(&mut state, actions);
        result
    }

    /// Remove a handle from the bound table if it is still the one bound.
    pub(crate) fn unbind_handle(
        &self,
        handle: &Arc<InstanceHandle>,
        instance_id: Uuid,
    ) -> Vec<ResolutionAction> {
        let mut actions = Vec::new();
        let mut state = self.state.lock().unwrap();
        let is_bound = state
            .bound_handles
            .get(&instance_id)
            .is_some_and(|bound| bound.handle.upgrade().is_some_and(|h| Arc::ptr_eq(&h, handle)));
        if is_bound {
            state.bound_handles.remove(&instance_id);
            // Removing the bound handle may let a pending reclaim through.
            Self::check_oldest_references(&mut state, &mut actions);
        }
        actions
    }

    /// Resolve every marker that has become the oldest pending request
    /// for its instance.
    ///
    /// A marker is gated twice: nothing older may remain in the global
    /// queue (an instance-less reference could still target this
    /// instance), and it must sit at the front of its per-instance queue.
    /// Resolution then compares the target version against the bound
    /// table: it succeeds unless a bound handle already holds an
    /// equal-or-higher version.
    fn check_oldest_references(state: &mut OwnerState, actions: &mut Vec<ResolutionAction>) {
        // Prune abandoned references (handle dropped without free).
        loop {
            let abandoned = match state.in_progress_handles.front() {
                Some(front) => front.handle().is_none(),
                None => break,
            };
            if !abandoned {
                break;
            }
            state.in_progress_handles.pop_front();
        }
        let oldest_global = state.in_progress_handles.front().map(|r| r.seq);

        let OwnerState {
            bound_handles,
            in_progress_per_instance,
            ..
        } = state;

        in_progress_per_instance.retain(|instance_id, queue| {
            loop {
                let Some(front) = queue.front().cloned() else {
                    break;
                };
                if oldest_global.is_some_and(|g| g < front.seq) {
                    // An older instance-less attempt may still claim this
                    // instance; keep waiting.
                    break;
                }
                let Some(front_handle) = front.handle() else {
                    queue.pop_front();
                    continue;
                };
                let mut inner = front.inner.lock().unwrap();
                let Some(waiter) = inner.waiter.take() else {
                    // Plain reference or already-resolved marker: it keeps
                    // its slot until commit or cancellation.
                    break;
                };
                let bound = bound_handles
                    .get(instance_id)
                    .and_then(|b| b.handle.upgrade().map(|h| (b.version, h)));
                match bound {
                    Some((bound_version, bound_handle))
                        if bound_version >= inner.target_version =>
                    {
                        // Lost: someone already holds an equal-or-higher
                        // version. The marker leaves the queue.
                        drop(inner);
                        queue.pop_front();
                        actions.push(ResolutionAction::SetConflicting {
                            handle: front_handle.clone(),
                            winner: bound_handle,
                        });
                        actions.push(ResolutionAction::ClearInProgressBind {
                            handle: front_handle,
                            reference: front.clone(),
                        });
                        actions.push(ResolutionAction::NotifyMarker {
                            waiter,
                            result: Err(InstancePersistenceError::HandleConflict {
                                instance_id: *instance_id,
                            }),
                        });
                        continue;
                    }
                    _ => {
                        // Won: the reference stays at the front as the
                        // in-progress bind until its transaction commits.
                        drop(inner);
                        actions.push(ResolutionAction::NotifyMarker {
                            waiter,
                            result: Ok(()),
                        });
                        break;
                    }
                }
            }
            !queue.is_empty()
        });
    }
}
