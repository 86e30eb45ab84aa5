//! Per-agent coordinator.
//!
//! One task owns each agent: the stdout/stderr readers, the exit wait, the
//! monitor timer, and the control channel all rendezvous on this task's
//! select loop, so a single receiver advances the agent state machine and
//! the record needs no locking. `completed` is published only after the
//! final output line has been processed.

use super::SupervisorContext;
use crate::{
    constants,
    events::Topic,
    learning::Completion,
    models::{AgentPhase, AgentRecord, AgentResult, AgentStatus, IssueKind},
    persistence,
    supervisor::output::OutputBuffer,
};
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// External control of one running agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMsg {
    /// SIGTERM now, SIGKILL after the grace window.
    Terminate,
    /// SIGKILL immediately.
    Kill,
}

/// Everything the coordinator needs to launch its child.
pub(super) struct SpawnSpec {
    pub record: AgentRecord,
    pub command: Vec<String>,
    pub workspace: PathBuf,
    pub grace: Duration,
    pub output_budget: usize,
    pub max_rss_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

enum AgentEvent {
    Line(StreamKind, String),
    Closed(StreamKind),
    /// Promotion fallback: initializing agents become running after a fixed
    /// delay even if the child has printed nothing yet.
    PromoteTick,
}

/// Why the child went away, beyond a voluntary exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    Terminated,
    Zombie,
    MemoryLimit,
}

pub(super) async fn run_agent(
    ctx: Arc<SupervisorContext>,
    spec: SpawnSpec,
    mut control: mpsc::Receiver<ControlMsg>,
) {
    let SpawnSpec {
        mut record,
        command,
        workspace,
        grace,
        output_budget,
        max_rss_mb,
    } = spec;

    let Some((program, args)) = command.split_first() else {
        record.result = Some(AgentResult {
            success: false,
            error: Some("spawn_failed".to_string()),
            duration_ms: 0,
            exit_code: None,
        });
        finalize(&ctx, record, None).await;
        return;
    };

    let mut child = match Command::new(program)
        .args(args)
        .current_dir(&workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(agent_id = %record.id, error = %e, "agent spawn failed");
            record.result = Some(AgentResult {
                success: false,
                error: Some("spawn_failed".to_string()),
                duration_ms: 0,
                exit_code: None,
            });
            finalize(&ctx, record, None).await;
            return;
        }
    };

    record.pid = child.id();
    ctx.store_record(&record).await;
    ctx.persist_live().await;

    let (event_tx, mut events) = mpsc::channel::<AgentEvent>(constants::STORE_CHANNEL_CAPACITY);
    spawn_reader(child.stdout.take(), StreamKind::Stdout, event_tx.clone());
    spawn_reader(child.stderr.take(), StreamKind::Stderr, event_tx.clone());
    {
        let promote_tx = event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(constants::RUNNING_PROMOTION_MS)).await;
            let _ = promote_tx.send(AgentEvent::PromoteTick).await;
        });
    }
    drop(event_tx);

    let mut buffer = OutputBuffer::new(output_budget);
    let mut streams_open = 2u8;
    let mut events_closed = false;
    let mut zombie_strikes = 0u32;
    let mut kill_reason: Option<KillReason> = None;
    let mut terminating = false;
    let mut last_stderr: Option<String> = None;

    let mut monitor_interval = tokio::time::interval_at(
        tokio::time::Instant::now() + Duration::from_millis(constants::MONITOR_SAMPLE_INTERVAL_MS),
        Duration::from_millis(constants::MONITOR_SAMPLE_INTERVAL_MS),
    );
    monitor_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let exit_status = loop {
        tokio::select! {
            status = child.wait() => {
                break status.ok();
            }
            maybe = events.recv(), if !events_closed => {
                match maybe {
                    Some(AgentEvent::Line(stream, line)) => {
                        promote(&ctx, &mut record).await;
                        if stream == StreamKind::Stderr {
                            last_stderr = Some(line.clone());
                        }
                        handle_line(&ctx, &mut record, &mut buffer, stream, line).await;
                    }
                    Some(AgentEvent::Closed(_)) => streams_open = streams_open.saturating_sub(1),
                    Some(AgentEvent::PromoteTick) => promote(&ctx, &mut record).await,
                    // A child can close its pipes and keep running; only
                    // the exit arm finishes the loop.
                    None => events_closed = true,
                }
            }
            maybe = control.recv() => {
                match maybe {
                    Some(ControlMsg::Terminate) if !terminating => {
                        terminating = true;
                        kill_reason = Some(KillReason::Terminated);
                        info!(agent_id = %record.id, "terminating agent (grace {:?})", grace);
                        send_sigterm(&record);
                        // Escalation path: the child either exits and the
                        // wait arm breaks, or this fires and force-kills.
                        let escalate = ctx.handle_sender(&record.id).await;
                        tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            if let Some(tx) = escalate {
                                let _ = tx.send(ControlMsg::Kill).await;
                            }
                        });
                    }
                    Some(ControlMsg::Terminate) => {}
                    Some(ControlMsg::Kill) => {
                        if kill_reason.is_none() {
                            kill_reason = Some(KillReason::Terminated);
                        }
                        warn!(agent_id = %record.id, "force-killing agent");
                        let _ = child.start_kill();
                    }
                    None => {}
                }
            }
            _ = monitor_interval.tick() => {
                if let Some(pid) = record.pid {
                    let sample = ctx.monitor.sample(pid).await;
                    if !sample.active {
                        zombie_strikes += 1;
                        debug!(agent_id = %record.id, strikes = zombie_strikes,
                               "monitor reports agent pid inactive");
                        if zombie_strikes >= constants::ZOMBIE_STRIKE_LIMIT {
                            kill_reason = Some(KillReason::Zombie);
                            let _ = child.start_kill();
                        }
                    } else {
                        zombie_strikes = 0;
                        if sample.rss_mb > max_rss_mb as f64 {
                            warn!(agent_id = %record.id, rss_mb = sample.rss_mb,
                                  "agent exceeded memory limit");
                            kill_reason = Some(KillReason::MemoryLimit);
                            let _ = child.start_kill();
                        }
                    }
                }
            }
        }
    };

    // The child is gone; drain whatever output is still buffered in the
    // pipes so `completed` is published after the final line.
    let drain = tokio::time::timeout(Duration::from_secs(1), async {
        while streams_open > 0 {
            match events.recv().await {
                Some(AgentEvent::Line(stream, line)) => {
                    promote(&ctx, &mut record).await;
                    if stream == StreamKind::Stderr {
                        last_stderr = Some(line.clone());
                    }
                    handle_line(&ctx, &mut record, &mut buffer, stream, line).await;
                }
                Some(AgentEvent::Closed(_)) => streams_open = streams_open.saturating_sub(1),
                Some(AgentEvent::PromoteTick) => {}
                None => break,
            }
        }
    })
    .await;
    if drain.is_err() {
        debug!(agent_id = %record.id, "output drain timed out");
    }

    // An agent that never printed still must have been announced before
    // its completion event.
    promote(&ctx, &mut record).await;

    let exit_code = exit_status.and_then(|status| {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            status.code().or_else(|| status.signal())
        }
        #[cfg(not(unix))]
        {
            status.code()
        }
    });

    let success = kill_reason.is_none() && exit_code == Some(0);
    let error = if success {
        None
    } else {
        Some(match kill_reason {
            Some(KillReason::Zombie) => "zombie".to_string(),
            Some(KillReason::Terminated) => "terminated".to_string(),
            Some(KillReason::MemoryLimit) => "memory limit exceeded".to_string(),
            None => match (exit_code, &last_stderr) {
                (Some(code), Some(tail)) => format!("exit code {code}: {tail}"),
                (Some(code), None) => format!("exit code {code}"),
                (None, _) => "exit status unavailable".to_string(),
            },
        })
    };

    record.output = buffer.lines();
    record.result = Some(AgentResult {
        success,
        error,
        duration_ms: record.duration_ms(),
        exit_code,
    });

    finalize(&ctx, record, kill_reason).await;
}

fn spawn_reader<R>(reader: Option<R>, kind: StreamKind, tx: mpsc::Sender<AgentEvent>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Some(reader) = reader {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(AgentEvent::Line(kind, line)).await.is_err() {
                    return;
                }
            }
        }
        let _ = tx.send(AgentEvent::Closed(kind)).await;
    });
}

fn send_sigterm(record: &AgentRecord) {
    let Some(pid) = record.pid else { return };
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM delivery failed");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

async fn promote(ctx: &SupervisorContext, record: &mut AgentRecord) {
    if record.status != AgentStatus::Initializing {
        return;
    }
    record.status = AgentStatus::Running;
    record.phase = AgentPhase::Working;
    ctx.store_record(record).await;
    ctx.persist_live().await;

    info!(agent_id = %record.id, task_id = %record.task_id, pid = ?record.pid, "agent running");
    ctx.bus.publish(
        Topic::AgentSpawned,
        json!({
            "agentId": record.id,
            "taskId": record.task_id,
            "pid": record.pid,
            "model": record.metadata.model,
            "taskType": record.task_type,
        }),
    );
}

async fn handle_line(
    ctx: &SupervisorContext,
    record: &mut AgentRecord,
    buffer: &mut OutputBuffer,
    stream: StreamKind,
    line: String,
) {
    let entry = buffer.push(line);
    record.output = buffer.lines();
    ctx.store_record(record).await;

    // Full stream goes to the append-only disk log regardless of what the
    // in-memory ring later drops.
    let log_path = ctx.paths.agent_output_log(&record.id);
    if let Err(e) = persistence::append_jsonl(
        &log_path,
        &json!({
            "timestamp": entry.timestamp,
            "stream": stream.as_str(),
            "line": entry.line,
        }),
    )
    .await
    {
        debug!(agent_id = %record.id, error = %e, "output log append failed");
    }

    ctx.bus.publish(
        Topic::AgentOutput,
        json!({
            "agentId": record.id,
            "taskId": record.task_id,
            "stream": stream.as_str(),
            "line": entry.line,
            "timestamp": entry.timestamp,
        }),
    );
}

/// Completion pipeline: write the record, clean up the worktree, feed the
/// learning/productivity/activity stores (in that order, awaited), release
/// the task, and only then publish `agent:completed`.
async fn finalize(ctx: &SupervisorContext, mut record: AgentRecord, kill_reason: Option<KillReason>) {
    // An agent whose child never started was never announced; the event
    // sequence per agent is still spawned -> completed.
    if record.status == AgentStatus::Initializing {
        ctx.bus.publish(
            Topic::AgentSpawned,
            json!({
                "agentId": record.id,
                "taskId": record.task_id,
                "pid": record.pid,
                "model": record.metadata.model,
                "taskType": record.task_type,
            }),
        );
    }

    record.status = AgentStatus::Completed;
    record.completed_at = Some(Utc::now());
    let duration_ms = record.duration_ms();
    if let Some(result) = record.result.as_mut() {
        result.duration_ms = duration_ms;
    }

    let success = record.result.as_ref().map(|r| r.success).unwrap_or(false);
    let error = record.result.as_ref().and_then(|r| r.error.clone());

    ctx.store_record(&record).await;
    ctx.persist_live().await;
    ctx.append_to_shard(&record).await;

    if let Some(branch) = record.metadata.worktree_branch.clone() {
        if let Some(repo) = ctx.source_repo_of(&record).await {
            // Merge only what succeeded; failures keep their branch for
            // inspection but lose the checkout.
            if let Err(e) = ctx
                .worktree
                .remove(&record.id, &repo, &branch, success)
                .await
            {
                warn!(agent_id = %record.id, error = %e, "worktree cleanup failed");
            }
        }
    }

    let completion = Completion {
        success,
        duration_ms: record.result.as_ref().map(|r| r.duration_ms).unwrap_or(0),
        error_category: error.as_deref().map(error_category),
        model_tier: record.metadata.model_tier,
    };
    if let Err(e) = ctx.learning.on_complete(&record.task_type, completion).await {
        error!(agent_id = %record.id, error = %e, "learning update failed");
    }
    if let Err(e) = ctx.productivity.on_task_completed(&record).await {
        error!(agent_id = %record.id, error = %e, "productivity update failed");
    }

    if let Some(app) = ctx.app_of(&record).await {
        let cooldown_ms = if success {
            0
        } else {
            let multiplier = ctx.learning.adaptive_cooldown(&record.task_type).await;
            (ctx.config.read().await.app_cooldown_ms as f64 * multiplier) as u64
        };
        if let Err(e) = ctx.activity.on_outcome(&app, success, cooldown_ms).await {
            warn!(agent_id = %record.id, error = %e, "activity update failed");
        }
    }

    if let Err(e) = ctx.tasks.release(record.queue, &record.task_id, success).await {
        warn!(agent_id = %record.id, error = %e, "task release failed");
    }

    ctx.remove_handle(&record.id).await;

    info!(agent_id = %record.id, task_id = %record.task_id, success,
          error = error.as_deref().unwrap_or(""), "agent completed");
    ctx.bus.publish(
        Topic::AgentCompleted,
        json!({
            "agentId": record.id,
            "taskId": record.task_id,
            "success": success,
            "durationMs": record.result.as_ref().map(|r| r.duration_ms),
            "error": error,
            "exitCode": record.result.as_ref().and_then(|r| r.exit_code),
        }),
    );

    if kill_reason == Some(KillReason::Zombie) {
        ctx.publish_health_issue(
            "agent",
            IssueKind::Warning,
            Some("warning"),
            format!(
                "agent {} for task {} was a zombie and has been reaped",
                record.id, record.task_id
            ),
        );
    }

    ctx.trim_completed().await;
}

fn error_category(error: &str) -> String {
    if error.starts_with("zombie") {
        "zombie".to_string()
    } else if error.starts_with("terminated") {
        "terminated".to_string()
    } else if error.starts_with("spawn_failed") {
        "spawn_failed".to_string()
    } else if error.starts_with("memory") {
        "memory_limit".to_string()
    } else if error.starts_with("exit code") {
        "exit_code".to_string()
    } else {
        "unknown".to_string()
    }
}
