//! 🎯 COS CORE CONSTANTS: System-wide configuration values
//!
//! Defaults here back the corresponding `config.json` options; the config
//! layer falls back to these when a key is absent.

// ⚙️ SCHEDULER CONFIGURATION
/// Scheduler tick period. One evaluation pass per minute keeps admission
/// latency low without hammering the task files.
pub const DEFAULT_EVALUATION_INTERVAL_MS: u64 = 60_000;

/// Health-check tick period (15 minutes).
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 900_000;

/// Cap on simultaneously live agents.
pub const DEFAULT_MAX_CONCURRENT_AGENTS: usize = 3;

/// Per-agent RSS kill threshold in megabytes.
pub const DEFAULT_MAX_PROCESS_MEMORY_MB: u64 = 2048;

/// Base cooldown applied to an app after a failed run, before the learning
/// multiplier is applied.
pub const DEFAULT_APP_COOLDOWN_MS: u64 = 300_000;

// 🤖 AGENT SUPERVISION
/// Grace period between SIGTERM and SIGKILL on terminate.
pub const DEFAULT_GRACEFUL_TERMINATE_MS: u64 = 10_000;

/// Drain budget for process-wide shutdown before stragglers are force-killed.
pub const DEFAULT_SHUTDOWN_DRAIN_MS: u64 = 30_000;

/// Per-agent in-memory output tail (256 KiB). Oldest lines are dropped once
/// the accounted byte budget is exceeded; the full stream lives on disk.
pub const DEFAULT_OUTPUT_BUFFER_BYTES: usize = 262_144;

/// Monitor sampling cadence per live agent.
pub const MONITOR_SAMPLE_INTERVAL_MS: u64 = 5_000;

/// Consecutive inactive monitor samples before a running agent is declared
/// a zombie and force-killed.
pub const ZOMBIE_STRIKE_LIMIT: u32 = 2;

/// An agent is promoted initializing → running on first output or after
/// this delay, whichever comes first.
pub const RUNNING_PROMOTION_MS: u64 = 2_000;

/// Completed agents retained in memory; older ones live only in day shards.
pub const MAX_COMPLETED_AGENTS_IN_MEMORY: usize = 200;

// 📊 LEARNING
/// Bounded window of recent durations per task type used for p80.
pub const DURATION_WINDOW_CAPACITY: usize = 50;

/// Minimum completions before p80 is trusted over the running mean.
pub const P80_MIN_SAMPLES: usize = 5;

/// Skip-list thresholds: a task type with at least this many completions and
/// a success rate below the floor is not attempted.
pub const SKIP_MIN_COMPLETED: u64 = 5;
pub const SKIP_SUCCESS_RATE_FLOOR: f64 = 0.30;

/// Adaptive cooldown multiplier bounds.
pub const COOLDOWN_MULTIPLIER_MIN: f64 = 1.0;
pub const COOLDOWN_MULTIPLIER_MAX: f64 = 8.0;

// 📈 PRODUCTIVITY
/// Daily history retention window.
pub const DAILY_HISTORY_RETENTION_DAYS: i64 = 90;

/// Minimum samples before an hour/day bucket is eligible for insights.
pub const INSIGHT_MIN_SAMPLES: u64 = 3;

// 💾 PERSISTENCE
/// Store update channels are bounded; senders apply backpressure rather
/// than growing without limit.
pub const STORE_CHANNEL_CAPACITY: usize = 256;

/// Event-bus broadcast capacity for push-stream subscribers. Laggy
/// receivers skip, they do not block publishers.
pub const EVENT_STREAM_CAPACITY: usize = 2048;

/// Day shards older than this many days are packed into monthly tar.gz
/// archives.
pub const SHARD_ARCHIVE_AFTER_DAYS: i64 = 30;

/// Process monitor hard budget; past this the sample reports inactive.
pub const MONITOR_TIMEOUT_MS: u64 = 1_000;
