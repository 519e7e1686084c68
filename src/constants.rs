//! System-wide timing and sizing defaults.
//!
//! Every value here is also a field on [`crate::config::EngineConfig`] and can
//! be overridden through environment variables; these are just the fallbacks.

/// Background scheduler tick interval.
pub const SCHEDULER_INTERVAL_MS: u64 = 10_000;

/// How long a reservation may sit in `PENDING_ACK`/`APPROVED_PENDING_ACK`
/// before the scheduler force-retries the task.
pub const ACK_TIMEOUT_MS: u64 = 30_000;

/// How long a task may sit in `IN_PROGRESS` without a progress update before
/// the scheduler treats it as stale and force-retries it.
pub const ASSIGNED_TIMEOUT_MS: u64 = 15 * 60 * 1000;

/// How long an agent may go without a heartbeat before its assigned tasks are
/// treated as orphaned.
pub const ORPHAN_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// How long an agent may go without a heartbeat before it is considered
/// OFFLINE (and eligible for registry cleanup).
pub const OFFLINE_THRESHOLD_MS: u64 = 2 * 60 * 1000;

/// Minimum spacing between two `lastSeen` writes for the same agent.
pub const HEARTBEAT_DEBOUNCE_MS: u64 = 10_000;

/// Upper bound accepted for `wait_for_prompt`'s `timeout` argument, in seconds.
pub const MAX_PROMPT_TIMEOUT_SECS: u64 = 300;

/// Default used for `wait_for_prompt` when `timeout` is missing or exceeds
/// [`MAX_PROMPT_TIMEOUT_SECS`].
pub const DEFAULT_PROMPT_TIMEOUT_SECS: u64 = 290;

/// Default long-poll timeout for `wait_for_task` (completion waits).
pub const DEFAULT_TASK_WAIT_TIMEOUT_SECS: u64 = 300;

/// Literal sentinel used for `from.id`/`from.name` when `assign_task` omits
/// `sourceAgentId`. Never resolved against the registry.
pub const DEFAULT_SOURCE_AGENT_ID: &str = "Da Boss";
