//! # CoS Core
//!
//! Chief-of-Staff supervisor: a long-running engine that reads task queues
//! from two files, admits tasks under concurrency and cooldown constraints,
//! spawns and supervises AI coding-agent subprocesses, streams their output
//! to subscribers, persists per-agent records, and learns from completion
//! history to refine routing, cooldowns, and duration estimates.
//!
//! ## Architecture
//!
//! - **Scheduler/Evaluator**: periodic admission loop promoting tasks to
//!   agent spawns
//! - **Agent Supervisor**: per-agent coordinator tasks owning the child
//!   process lifecycle, zombie recovery included
//! - **Stores**: tasks (file-backed queues), learning, productivity, and
//!   per-app activity, each behind a serial updater
//! - **Event Bus**: process-wide pub/sub feeding in-process handlers and
//!   push-stream subscribers
//!
//! The engine facade (`CosEngine`) wires everything and exposes the
//! control surface.

/// Per-app cooldown and attempt tracking
pub mod activity;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Engine facade and control surface
pub mod engine;
/// Error types and handling
pub mod error;
/// Process-wide event bus
pub mod events;
/// Per-task-type completion statistics
pub mod learning;
/// Core data models
pub mod models;
/// PID liveness and resource sampling
pub mod monitor;
/// Atomic JSON persistence and data layout
pub mod persistence;
/// Streaks, patterns, and trends
pub mod productivity;
/// Task classification and model routing policies
pub mod routing;
/// Evaluation and health-check loops
pub mod scheduler;
/// Agent lifecycle supervision
pub mod supervisor;
/// File-backed task queues
pub mod tasks;
/// Isolated git worktrees for agents
pub mod worktree;

#[cfg(test)]
mod tests;

pub use engine::CosEngine;
pub use error::{CosError, Result};
