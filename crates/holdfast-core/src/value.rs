// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Leaf value types carried through instance views: metadata values and
//! correlation keys.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a value participates in persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceValueOptions {
    /// The value may be skipped by providers that cannot store it.
    pub optional: bool,
    /// The value is written but never handed back on load.
    pub write_only: bool,
}

/// An immutable metadata value wrapper.
///
/// A value of `None` is the distinguished *deleted value* marker: writing
/// it to a metadata dictionary removes the entry when pending writes are
/// merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceValue {
    /// The payload, or `None` for the deleted-value marker.
    pub value: Option<serde_json::Value>,
    /// Persistence options for this value.
    pub options: InstanceValueOptions,
}

impl InstanceValue {
    /// Create a value with default options.
    pub fn new(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: Some(value.into()),
            options: InstanceValueOptions::default(),
        }
    }

    /// Create a value with explicit options.
    pub fn with_options(value: impl Into<serde_json::Value>, options: InstanceValueOptions) -> Self {
        Self {
            value: Some(value.into()),
            options,
        }
    }

    /// The marker that deletes a metadata entry when merged.
    pub fn deleted_value() -> Self {
        Self {
            value: None,
            options: InstanceValueOptions {
                optional: true,
                write_only: false,
            },
        }
    }

    /// Whether this is the deleted-value marker.
    pub fn is_deleted_value(&self) -> bool {
        self.value.is_none()
    }
}

impl From<serde_json::Value> for InstanceValue {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}

/// The lifecycle state of a correlation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InstanceKeyState {
    /// The key is not known to the view.
    #[default]
    Unknown,
    /// The key is associated with the instance and can route work to it.
    Associated,
    /// The key has been completed and can no longer route work.
    Completed,
}

/// A correlation key: an identity plus its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceKey {
    /// The key identity.
    pub value: Uuid,
    /// Metadata attached to the key at association time.
    pub metadata: HashMap<String, InstanceValue>,
}

impl InstanceKey {
    /// Create a key with no metadata.
    pub fn new(value: Uuid) -> Self {
        Self {
            value,
            metadata: HashMap::new(),
        }
    }

    /// Create a key carrying metadata.
    pub fn with_metadata(value: Uuid, metadata: HashMap<String, InstanceValue>) -> Self {
        Self { value, metadata }
    }
}
