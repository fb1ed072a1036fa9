// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Holdfast Core - Durable Instance Persistence Coordination
//!
//! This crate implements the coordination protocol between long-running
//! workflow instances and whatever store persists them: handle lifecycle,
//! lock acquisition and reclamation, transactional command execution, and
//! event signaling. It persists nothing itself - a provider plugs in
//! underneath, and a host transaction coordinator plugs in above.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Workflow Runtime                                 │
//! │                  (issues persistence commands)                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            │ create_instance_handle / execute / wait_for_events
//!            ▼
//! ┌───────────────────────┐     one per owner id     ┌─────────────────────┐
//! │     InstanceStore     │─────────────────────────▶│    InstanceOwner    │
//! │  (This Crate)         │    weak registry          │  bound-handle table │
//! │  routes commands      │                           │  FIFO bind queues   │
//! └───────────┬───────────┘                           │  event registry     │
//!             │ try_command                           └─────────────────────┘
//!             ▼                                                 ▲
//! ┌───────────────────────┐   InstancePersistenceContext        │ commit /
//! │    StoreProvider      │   (bind/read/write primitives)      │ arbitrate
//! │  (SQL, memory, ...)   │──────────────────────────────────────┘
//! └───────────────────────┘
//! ```
//!
//! # Handle state machine
//!
//! ```text
//! created ──▶ bound to owner ──▶ bound to instance ──▶ bound to lock
//!    │              │                   │                    │
//!    └──────────────┴───────────────────┴────────────────────┴──▶ freed
//! ```
//!
//! Every bind is settable exactly once. A handle admits one in-flight
//! command at a time, and `free()` is idempotent and reachable from every
//! state - deferred, but never lost, when a command is mid-flight.
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `create_instance_handle` | Allocate a handle, optionally pre-bound to an owner/instance |
//! | `execute` | Run a command; unsupported commands reduce into sub-commands |
//! | `execute_with_transaction` | Same, deferring view commit to the host transaction |
//! | `wait_for_events` | Level-triggered wait on the owner's signaled events |
//! | `signal_event` / `reset_event` | Raise or clear an event for an owner's handles |
//! | `InstanceHandle::free` | Cancel pending binds, unbind, notify the provider once |
//!
//! # Lock arbitration
//!
//! Lock ownership may be claimed by several competing in-flight
//! transactions before any of them commits. Conflicts resolve by a fixed
//! contract: a strictly higher lock version wins and evicts the loser,
//! equal positive versions are a fatal double-bind, version 0 is the
//! "no real lock yet" bootstrap state, and pending reclaims resolve
//! strictly in enqueue order - never by wall clock.
//!
//! # Locking discipline
//!
//! Lock order is always handle-lock then owner-lock, never the reverse.
//! Waking waiters and touching other handles happens strictly after every
//! lock is released. No lock is ever held across an `.await`.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `HOLDFAST_OWNER_SCAN_BATCH` | No | `8` | Registry entries swept per owner lookup |
//! | `HOLDFAST_EXECUTE_TIMEOUT_MS` | No | `30000` | Execute timeout applied for `Duration::MAX` |
//!
//! # Modules
//!
//! - [`command`]: The command vocabulary contract (validate/reduce)
//! - [`config`]: Configuration from environment variables
//! - [`context`]: The transactional execution scope handed to commands
//! - [`error`]: Error taxonomy with retryability classification
//! - [`event`]: Named events for wait/signal
//! - [`handle`]: Instance handles and their transaction enlistment
//! - [`owner`]: Per-owner lock arbitration and bind queues
//! - [`store`]: The store façade and provider trait
//! - [`transaction`]: The consumed transaction-enlistment interface
//! - [`value`]: Metadata values and correlation keys
//! - [`view`]: Frozen, consistency-flagged state snapshots

#![deny(missing_docs)]

/// The command vocabulary contract.
pub mod command;

/// Configuration from environment variables.
pub mod config;

/// The transactional execution scope handed to commands.
pub mod context;

/// Error taxonomy for coordination failures.
pub mod error;

/// Named events for wait/signal.
pub mod event;

/// Instance handles: bind lifecycle, free semantics, enlistment.
pub mod handle;

/// Per-owner lock arbitration and bind queues.
pub mod owner;

/// The store façade and the provider trait.
pub mod store;

/// The transaction-enlistment interface consumed from the host.
pub mod transaction;

/// Metadata values and correlation keys.
pub mod value;

/// Consistency-flagged state snapshots.
pub mod view;

mod deadline;

pub use command::InstancePersistenceCommand;
pub use config::{Config, ConfigError};
pub use context::InstancePersistenceContext;
pub use error::{InstancePersistenceError, Result};
pub use event::InstancePersistenceEvent;
pub use handle::InstanceHandle;
pub use owner::InstanceOwner;
pub use store::{InstanceStore, StoreProvider};
pub use transaction::{
    CommittableTransaction, Transaction, TransactionOutcome, TransactionParticipant,
};
pub use value::{InstanceKey, InstanceKeyState, InstanceValue, InstanceValueOptions};
pub use view::{
    InstanceKeyView, InstanceState, InstanceValueConsistency, InstanceView,
};
