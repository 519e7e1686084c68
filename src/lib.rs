//! # Agent Broker
//!
//! A scheduling and coordination engine for a pool of worker agents: agents
//! register, long-poll for work, and a capability-and-workspace-aware
//! matcher hands out tasks under a single reservation mutex. A background
//! scheduler recovers stuck reservations, stale in-progress tasks, and
//! orphaned agents on an interval.
//!
//! ## Architecture
//!
//! - [`registry`] — agent identity, heartbeat debounce, derived status
//! - [`queue`] — task lifecycle: enqueue, status transitions, long-poll wait, ack
//! - [`matcher`] — the scoring function and the reservation mutex
//! - [`scheduler`] — the background recovery sweeps
//! - [`persistence`] — the storage trait and its in-memory implementation
//! - [`events`] — the broadcast event bus
//! - [`tools`] — the tool-call dispatch table the outer transport calls into
//! - [`engine`] — wires every collaborator together

/// Monotonic time source, real and fake.
pub mod clock;
/// Environment-sourced engine configuration.
pub mod config;
/// System-wide timing and sizing defaults.
pub mod constants;
/// Wires every collaborator together behind one struct.
pub mod engine;
/// Error types and the error-code taxonomy.
pub mod error;
/// The broadcast event bus.
pub mod events;
/// Capability/workspace scoring and the reservation mutex.
pub mod matcher;
/// Core data model.
pub mod models;
/// The storage trait and its in-memory implementation.
pub mod persistence;
/// Task lifecycle: enqueue, status transitions, long-poll wait, ack.
pub mod queue;
/// Agent identity lifecycle.
pub mod registry;
/// Background recovery sweeps.
pub mod scheduler;
/// The tool-call dispatch table.
pub mod tools;
/// The prompt-validator predicate `assign_task` consumes.
pub mod validation;
/// The long-poll waiter table.
pub mod waiter;

pub use engine::Engine;
pub use error::{BrokerError, Result};
