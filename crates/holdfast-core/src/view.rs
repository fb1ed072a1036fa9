// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Versioned snapshots of persisted instance, owner, and key state.
//!
//! A view is mutable while a command episode works on it and frozen when
//! the episode commits. Each of the four data categories (instance data,
//! instance metadata, owner metadata, keys) tracks its own consistency:
//! authoritative, in-doubt (read outside the lock, may be stale), or
//! partial (incremental read, may be incomplete).

use std::collections::HashMap;

use uuid::Uuid;

use crate::value::{InstanceKeyState, InstanceValue};

/// Consistency flags for one data category of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstanceValueConsistency {
    /// The data was read without holding the instance lock and may be
    /// stale.
    pub in_doubt: bool,
    /// The data was read incrementally and may be incomplete.
    pub partial: bool,
}

impl InstanceValueConsistency {
    /// Fully authoritative: not in-doubt and not partial.
    pub fn is_authoritative(&self) -> bool {
        !self.in_doubt && !self.partial
    }
}

/// The lifecycle state of a persisted instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceState {
    /// Nothing is known about the instance.
    #[default]
    Unknown,
    /// The instance id is reserved but no state has been persisted.
    Uninitialized,
    /// The instance has persisted state.
    Initialized,
    /// The instance has completed and its state may be unloadable.
    Completed,
}

/// Per-key view: state plus metadata with a pending-write overlay.
///
/// Metadata writes accumulate in an overlay without copying the base map;
/// the merged dictionary is materialized only when something actually
/// reads it (and at freeze time), then cached until the next write.
#[derive(Debug, Clone)]
pub struct InstanceKeyView {
    key: Uuid,
    state: InstanceKeyState,
    metadata: HashMap<String, InstanceValue>,
    metadata_consistency: InstanceValueConsistency,
    pending_writes: Vec<(String, InstanceValue)>,
    merged: Option<HashMap<String, InstanceValue>>,
}

impl InstanceKeyView {
    pub(crate) fn new(
        key: Uuid,
        state: InstanceKeyState,
        metadata: HashMap<String, InstanceValue>,
        metadata_consistency: InstanceValueConsistency,
    ) -> Self {
        Self {
            key,
            state,
            metadata,
            metadata_consistency,
            pending_writes: Vec::new(),
            merged: None,
        }
    }

    /// The key identity.
    pub fn instance_key(&self) -> Uuid {
        self.key
    }

    /// The key lifecycle state.
    pub fn state(&self) -> InstanceKeyState {
        self.state
    }

    /// The key metadata.
    ///
    /// On a frozen view this is the merged dictionary including all
    /// accumulated writes. Before freezing it reflects the last
    /// materialization.
    pub fn metadata(&self) -> &HashMap<String, InstanceValue> {
        self.merged.as_ref().unwrap_or(&self.metadata)
    }

    /// Consistency flags for the key metadata.
    pub fn metadata_consistency(&self) -> InstanceValueConsistency {
        self.metadata_consistency
    }

    pub(crate) fn set_state(&mut self, state: InstanceKeyState) {
        self.state = state;
    }

    /// Replace the base metadata with a fresh read, keeping any pending
    /// writes layered on top.
    pub(crate) fn set_metadata(
        &mut self,
        metadata: HashMap<String, InstanceValue>,
        consistency: InstanceValueConsistency,
    ) {
        self.metadata = metadata;
        self.metadata_consistency = consistency;
        self.merged = None;
    }

    /// Record a metadata write without materializing the merged map.
    pub(crate) fn wrote_metadata_value(&mut self, name: String, value: InstanceValue) {
        self.merged = None;
        self.pending_writes.push((name, value));
    }

    /// Materialize and return the merged metadata.
    pub(crate) fn merged_metadata(&mut self) -> &HashMap<String, InstanceValue> {
        self.materialize();
        self.metadata()
    }

    fn materialize(&mut self) {
        if self.merged.is_some() || self.pending_writes.is_empty() {
            return;
        }
        let mut merged = self.metadata.clone();
        for (name, value) in &self.pending_writes {
            if value.is_deleted_value() {
                merged.remove(name);
            } else {
                merged.insert(name.clone(), value.clone());
            }
        }
        self.merged = Some(merged);
    }
}

/// A snapshot of persisted instance/owner/key state.
///
/// `Clone` deliberately yields an *unfrozen* deep copy: cloning is how a
/// new working view is forked from a committed one, and mutating a clone
/// never affects its source.
#[derive(Debug)]
pub struct InstanceView {
    instance_id: Option<Uuid>,
    instance_version: i64,
    instance_state: InstanceState,
    owner_id: Option<Uuid>,
    lock_token: Option<Uuid>,
    instance_data: HashMap<String, InstanceValue>,
    instance_data_consistency: InstanceValueConsistency,
    instance_metadata: HashMap<String, InstanceValue>,
    instance_metadata_consistency: InstanceValueConsistency,
    instance_owner_metadata: HashMap<String, InstanceValue>,
    instance_owner_metadata_consistency: InstanceValueConsistency,
    instance_keys: HashMap<Uuid, InstanceKeyView>,
    instance_keys_consistency: InstanceValueConsistency,
    frozen: bool,
}

impl Clone for InstanceView {
    fn clone(&self) -> Self {
        Self {
            instance_id: self.instance_id,
            instance_version: self.instance_version,
            instance_state: self.instance_state,
            owner_id: self.owner_id,
            lock_token: self.lock_token,
            instance_data: self.instance_data.clone(),
            instance_data_consistency: self.instance_data_consistency,
            instance_metadata: self.instance_metadata.clone(),
            instance_metadata_consistency: self.instance_metadata_consistency,
            instance_owner_metadata: self.instance_owner_metadata.clone(),
            instance_owner_metadata_consistency: self.instance_owner_metadata_consistency,
            instance_keys: self.instance_keys.clone(),
            instance_keys_consistency: self.instance_keys_consistency,
            frozen: false,
        }
    }
}

impl Default for InstanceView {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceView {
    /// Create an empty, unbound view.
    pub fn new() -> Self {
        Self {
            instance_id: None,
            instance_version: -1,
            instance_state: InstanceState::Unknown,
            owner_id: None,
            lock_token: None,
            instance_data: HashMap::new(),
            instance_data_consistency: InstanceValueConsistency::default(),
            instance_metadata: HashMap::new(),
            instance_metadata_consistency: InstanceValueConsistency::default(),
            instance_owner_metadata: HashMap::new(),
            instance_owner_metadata_consistency: InstanceValueConsistency::default(),
            instance_keys: HashMap::new(),
            instance_keys_consistency: InstanceValueConsistency::default(),
            frozen: false,
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// The instance this view describes, if bound.
    pub fn instance_id(&self) -> Option<Uuid> {
        self.instance_id
    }

    /// The lock version, `-1` until bound.
    pub fn instance_version(&self) -> i64 {
        self.instance_version
    }

    /// The instance lifecycle state.
    pub fn instance_state(&self) -> InstanceState {
        self.instance_state
    }

    /// The owner this view is scoped to, if bound.
    pub fn owner_id(&self) -> Option<Uuid> {
        self.owner_id
    }

    /// The owner's opaque lock token, if bound.
    pub fn lock_token(&self) -> Option<Uuid> {
        self.lock_token
    }

    /// Whether the view is bound to a specific instance.
    pub fn is_bound_to_instance(&self) -> bool {
        self.instance_id.is_some()
    }

    /// Whether the view is bound to an owner.
    pub fn is_bound_to_owner(&self) -> bool {
        self.owner_id.is_some()
    }

    /// Whether the view is bound to the instance lock.
    ///
    /// Version `0` counts as bound: it is the "no real lock yet"
    /// bootstrap state an instance passes through before its first
    /// versioned lock.
    pub fn is_bound_to_lock(&self) -> bool {
        self.instance_version >= 0
    }

    /// Whether the view has been frozen.
    pub fn is_read_only(&self) -> bool {
        self.frozen
    }

    // ========================================================================
    // Data categories
    // ========================================================================

    /// The instance data dictionary.
    pub fn instance_data(&self) -> &HashMap<String, InstanceValue> {
        &self.instance_data
    }

    /// Consistency of [`instance_data`](Self::instance_data).
    pub fn instance_data_consistency(&self) -> InstanceValueConsistency {
        self.instance_data_consistency
    }

    /// The instance metadata dictionary.
    pub fn instance_metadata(&self) -> &HashMap<String, InstanceValue> {
        &self.instance_metadata
    }

    /// Consistency of [`instance_metadata`](Self::instance_metadata).
    pub fn instance_metadata_consistency(&self) -> InstanceValueConsistency {
        self.instance_metadata_consistency
    }

    /// The owner metadata dictionary.
    pub fn instance_owner_metadata(&self) -> &HashMap<String, InstanceValue> {
        &self.instance_owner_metadata
    }

    /// Consistency of [`instance_owner_metadata`](Self::instance_owner_metadata).
    pub fn instance_owner_metadata_consistency(&self) -> InstanceValueConsistency {
        self.instance_owner_metadata_consistency
    }

    /// The keys known to this view.
    pub fn instance_keys(&self) -> &HashMap<Uuid, InstanceKeyView> {
        &self.instance_keys
    }

    /// Consistency of the key set as a whole.
    pub fn instance_keys_consistency(&self) -> InstanceValueConsistency {
        self.instance_keys_consistency
    }

    // ========================================================================
    // Freeze
    // ========================================================================

    /// Freeze the view. Materializes pending key-metadata writes and makes
    /// every subsequent mutation a fatal assertion. Idempotent.
    pub fn make_read_only(&mut self) {
        if self.frozen {
            return;
        }
        for key_view in self.instance_keys.values_mut() {
            key_view.materialize();
        }
        self.frozen = true;
    }

    /// Deep copy that stays frozen, for stable caller-visible results.
    pub(crate) fn clone_frozen(&self) -> Self {
        let mut copy = self.clone();
        copy.frozen = self.frozen;
        copy
    }

    fn assert_mutable(&self) {
        assert!(!self.frozen, "attempted to mutate a read-only instance view");
    }

    // ========================================================================
    // Mutators (crate-internal, context-gated)
    // ========================================================================

    pub(crate) fn set_instance_id(&mut self, instance_id: Uuid) {
        self.assert_mutable();
        self.instance_id = Some(instance_id);
    }

    pub(crate) fn set_instance_version(&mut self, version: i64) {
        self.assert_mutable();
        self.instance_version = version;
    }

    pub(crate) fn set_instance_state(&mut self, state: InstanceState) {
        self.assert_mutable();
        self.instance_state = state;
    }

    pub(crate) fn set_owner(&mut self, owner_id: Uuid, lock_token: Uuid) {
        self.assert_mutable();
        self.owner_id = Some(owner_id);
        self.lock_token = Some(lock_token);
    }

    pub(crate) fn set_instance_data(
        &mut self,
        data: HashMap<String, InstanceValue>,
        consistency: InstanceValueConsistency,
    ) {
        self.assert_mutable();
        self.instance_data = data;
        self.instance_data_consistency = consistency;
    }

    pub(crate) fn set_instance_metadata(
        &mut self,
        metadata: HashMap<String, InstanceValue>,
        consistency: InstanceValueConsistency,
    ) {
        self.assert_mutable();
        self.instance_metadata = metadata;
        self.instance_metadata_consistency = consistency;
    }

    pub(crate) fn write_instance_metadata_value(&mut self, name: String, value: InstanceValue) {
        self.assert_mutable();
        if value.is_deleted_value() {
            self.instance_metadata.remove(&name);
        } else {
            self.instance_metadata.insert(name, value);
        }
    }

    pub(crate) fn set_instance_owner_metadata(
        &mut self,
        metadata: HashMap<String, InstanceValue>,
        consistency: InstanceValueConsistency,
    ) {
        self.assert_mutable();
        self.instance_owner_metadata = metadata;
        self.instance_owner_metadata_consistency = consistency;
    }

    pub(crate) fn write_instance_owner_metadata_value(
        &mut self,
        name: String,
        value: InstanceValue,
    ) {
        self.assert_mutable();
        if value.is_deleted_value() {
            self.instance_owner_metadata.remove(&name);
        } else {
            self.instance_owner_metadata.insert(name, value);
        }
    }

    pub(crate) fn set_instance_keys_consistency(&mut self, consistency: InstanceValueConsistency) {
        self.assert_mutable();
        self.instance_keys_consistency = consistency;
    }

    pub(crate) fn insert_instance_key(&mut self, key_view: InstanceKeyView) {
        self.assert_mutable();
        self.instance_keys.insert(key_view.instance_key(), key_view);
    }

    pub(crate) fn remove_instance_key(&mut self, key: &Uuid) -> Option<InstanceKeyView> {
        self.assert_mutable();
        self.instance_keys.remove(key)
    }

    pub(crate) fn instance_key_mut(&mut self, key: &Uuid) -> Option<&mut InstanceKeyView> {
        self.assert_mutable();
        self.instance_keys.get_mut(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_view() -> InstanceView {
        let mut view = InstanceView::new();
        view.set_instance_id(Uuid::new_v4());
        view.set_instance_version(3);
        view.set_instance_state(InstanceState::Initialized);
        let mut data = HashMap::new();
        data.insert("position".to_string(), InstanceValue::new(42));
        view.set_instance_data(data, InstanceValueConsistency::default());
        view.insert_instance_key(InstanceKeyView::new(
            Uuid::new_v4(),
            InstanceKeyState::Associated,
            HashMap::new(),
            InstanceValueConsistency::default(),
        ));
        view
    }

    #[test]
    fn test_new_view_is_unbound() {
        let view = InstanceView::new();
        assert!(!view.is_bound_to_instance());
        assert!(!view.is_bound_to_owner());
        assert!(!view.is_bound_to_lock());
        assert_eq!(view.instance_version(), -1);
        assert_eq!(view.instance_state(), InstanceState::Unknown);
    }

    #[test]
    fn test_version_zero_counts_as_bound() {
        let mut view = InstanceView::new();
        view.set_instance_version(0);
        assert!(view.is_bound_to_lock());
    }

    #[test]
    fn test_clone_is_independent_and_unfrozen() {
        let mut view = sample_view();
        view.make_read_only();

        let mut copy = view.clone();
        assert!(!copy.is_read_only());
        assert_eq!(copy.instance_data(), view.instance_data());
        assert_eq!(copy.instance_keys().len(), view.instance_keys().len());
        assert_eq!(
            copy.instance_data_consistency(),
            view.instance_data_consistency()
        );

        copy.write_instance_metadata_value("extra".to_string(), InstanceValue::new(true));
        copy.set_instance_data(HashMap::new(), InstanceValueConsistency::default());
        assert!(view.instance_metadata().is_empty());
        assert_eq!(view.instance_data().len(), 1);
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn test_frozen_view_rejects_mutation() {
        let mut view = sample_view();
        view.make_read_only();
        view.set_instance_version(4);
    }

    #[test]
    fn test_make_read_only_is_idempotent() {
        let mut view = sample_view();
        view.make_read_only();
        view.make_read_only();
        assert!(view.is_read_only());
    }

    #[test]
    fn test_key_view_lazy_merge() {
        let mut base = HashMap::new();
        base.insert("a".to_string(), InstanceValue::new(1));
        base.insert("b".to_string(), InstanceValue::new(2));
        let mut kv = InstanceKeyView::new(
            Uuid::new_v4(),
            InstanceKeyState::Associated,
            base,
            InstanceValueConsistency::default(),
        );

        // Writes do not touch the base map.
        kv.wrote_metadata_value("b".to_string(), InstanceValue::new(20));
        kv.wrote_metadata_value("b".to_string(), InstanceValue::deleted_value());
        kv.wrote_metadata_value("c".to_string(), InstanceValue::new(3));
        assert_eq!(kv.metadata().len(), 2, "no materialization before a read");

        // First read materializes and caches.
        let merged = kv.merged_metadata();
        assert_eq!(merged.len(), 2);
        assert!(!merged.contains_key("b"), "later delete wins over write");
        assert_eq!(
            merged.get("c").and_then(|v| v.value.clone()),
            Some(serde_json::json!(3))
        );

        // A new write invalidates the cache; the next read re-merges.
        kv.wrote_metadata_value("d".to_string(), InstanceValue::new(4));
        assert_eq!(kv.merged_metadata().len(), 3);
    }

    #[test]
    fn test_freeze_materializes_key_writes() {
        let mut view = sample_view();
        let key = *view.instance_keys().keys().next().unwrap();
        view.instance_key_mut(&key)
            .unwrap()
            .wrote_metadata_value("tag".to_string(), InstanceValue::new("x"));
        view.make_read_only();
        assert!(view.instance_keys()[&key].metadata().contains_key("tag"));
    }

    #[test]
    fn test_deleted_marker_removes_metadata_entry() {
        let mut view = InstanceView::new();
        view.write_instance_metadata_value("k".to_string(), InstanceValue::new(1));
        assert_eq!(view.instance_metadata().len(), 1);
        view.write_instance_metadata_value("k".to_string(), InstanceValue::deleted_value());
        assert!(view.instance_metadata().is_empty());
    }

    #[test]
    fn test_consistency_flags() {
        let c = InstanceValueConsistency::default();
        assert!(c.is_authoritative());
        let c = InstanceValueConsistency {
            in_doubt: true,
            partial: false,
        };
        assert!(!c.is_authoritative());
    }
}
