//! Agent supervisor: owns every managed agent from spawn to completion.
//!
//! The supervisor keeps two maps: `records` (snapshots of agent state,
//! live and recently completed) and `handles` (control channels into the
//! per-agent coordinator tasks). All record mutation happens inside the
//! coordinators; everything here reads snapshots or sends control messages.

use crate::{
    activity::ActivityStore,
    config::Config,
    constants,
    events::{EventBus, Topic},
    learning::LearningStore,
    models::{AgentMetadata, AgentRecord, AgentResult, AgentStatus, IssueKind, Queue, Task},
    monitor::ProcessMonitor,
    persistence::{self, DataPaths},
    productivity::ProductivityStore,
    routing::{ModelRouter, TaskClassifier},
    tasks::TaskStore,
    worktree::WorkspaceProvider,
    CosError, Result,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

mod agent;
pub mod output;
#[cfg(test)]
mod tests;

pub use agent::ControlMsg;

use agent::SpawnSpec;

/// Control-side view of one live agent.
pub(crate) struct AgentHandle {
    control: mpsc::Sender<ControlMsg>,
    source_repo: Option<PathBuf>,
    app: Option<String>,
}

/// Shared context the coordinators run against.
pub(crate) struct SupervisorContext {
    pub paths: DataPaths,
    pub config: Arc<RwLock<Config>>,
    pub bus: EventBus,
    pub monitor: ProcessMonitor,
    pub learning: LearningStore,
    pub productivity: ProductivityStore,
    pub activity: ActivityStore,
    pub tasks: TaskStore,
    pub worktree: Arc<dyn WorkspaceProvider>,
    pub records: RwLock<HashMap<String, AgentRecord>>,
    pub handles: RwLock<HashMap<String, AgentHandle>>,
}

impl SupervisorContext {
    pub async fn store_record(&self, record: &AgentRecord) {
        let mut records = self.records.write().await;
        records.insert(record.id.clone(), record.clone());
    }

    /// Rewrite `live.json` from the current live set. Called on every state
    /// transition, so a crash leaves at most one transition unrecorded.
    pub async fn persist_live(&self) {
        let live: Vec<AgentRecord> = {
            let records = self.records.read().await;
            let mut live: Vec<AgentRecord> =
                records.values().filter(|r| r.is_live()).cloned().collect();
            live.sort_by(|a, b| a.id.cmp(&b.id));
            live
        };
        if let Err(e) = persistence::write_json(&self.paths.live_agents(), &live).await {
            warn!(error = %e, "failed to persist live agents");
        }
    }

    /// Append a completed record to its day shard, replacing any previous
    /// version of the same agent so retries stay idempotent.
    pub async fn append_to_shard(&self, record: &AgentRecord) {
        let date = record
            .completed_at
            .map(|at| at.date_naive())
            .unwrap_or_else(|| Utc::now().date_naive());
        let shard = self.paths.agent_shard(date);

        let mut entries: Vec<AgentRecord> = persistence::read_json(&shard, Vec::new()).await;
        entries.retain(|existing| existing.id != record.id);
        entries.push(record.clone());
        if let Err(e) = persistence::write_json(&shard, &entries).await {
            warn!(agent_id = %record.id, error = %e, "failed to persist agent shard");
        }
    }

    pub async fn remove_handle(&self, agent_id: &str) {
        self.handles.write().await.remove(agent_id);
    }

    pub async fn handle_sender(&self, agent_id: &str) -> Option<mpsc::Sender<ControlMsg>> {
        self.handles.read().await.get(agent_id).map(|h| h.control.clone())
    }

    pub async fn source_repo_of(&self, record: &AgentRecord) -> Option<PathBuf> {
        self.handles
            .read()
            .await
            .get(&record.id)
            .and_then(|h| h.source_repo.clone())
    }

    pub async fn app_of(&self, record: &AgentRecord) -> Option<String> {
        self.handles.read().await.get(&record.id).and_then(|h| h.app.clone())
    }

    pub fn publish_health_issue(
        &self,
        category: &str,
        kind: IssueKind,
        severity: Option<&str>,
        message: String,
    ) {
        self.bus.publish(
            Topic::HealthCheck,
            json!({
                "metrics": serde_json::Value::Null,
                "issues": [{
                    "category": category,
                    "type": kind,
                    "severity": severity,
                    "message": message,
                }],
            }),
        );
    }

    /// Bound the completed set in memory; older completions live only in
    /// their day shards. Agent ids are ULIDs, so id order is age order.
    pub async fn trim_completed(&self) {
        let mut records = self.records.write().await;
        let mut completed: Vec<String> = records
            .values()
            .filter(|r| !r.is_live())
            .map(|r| r.id.clone())
            .collect();
        if completed.len() <= constants::MAX_COMPLETED_AGENTS_IN_MEMORY {
            return;
        }
        completed.sort();
        let excess = completed.len() - constants::MAX_COMPLETED_AGENTS_IN_MEMORY;
        for id in completed.into_iter().take(excess) {
            records.remove(&id);
        }
    }
}

/// Aggregate counters over the known agent set.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub total: usize,
    pub live: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub avg_duration_ms: f64,
}

#[derive(Clone)]
pub struct AgentSupervisor {
    ctx: Arc<SupervisorContext>,
    classifier: Arc<dyn TaskClassifier>,
    router: Arc<dyn ModelRouter>,
}

impl AgentSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        paths: DataPaths,
        config: Arc<RwLock<Config>>,
        bus: EventBus,
        monitor: ProcessMonitor,
        learning: LearningStore,
        productivity: ProductivityStore,
        activity: ActivityStore,
        tasks: TaskStore,
        worktree: Arc<dyn WorkspaceProvider>,
        classifier: Arc<dyn TaskClassifier>,
        router: Arc<dyn ModelRouter>,
    ) -> Self {
        Self {
            ctx: Arc::new(SupervisorContext {
                paths,
                config,
                bus,
                monitor,
                learning,
                productivity,
                activity,
                tasks,
                worktree,
                records: RwLock::new(HashMap::new()),
                handles: RwLock::new(HashMap::new()),
            }),
            classifier,
            router,
        }
    }

    pub async fn active_count(&self) -> usize {
        let records = self.ctx.records.read().await;
        records.values().filter(|r| r.is_live()).count()
    }

    pub async fn get_agents(&self) -> Vec<AgentRecord> {
        let records = self.ctx.records.read().await;
        let mut agents: Vec<AgentRecord> = records.values().cloned().collect();
        agents.sort_by(|a, b| b.id.cmp(&a.id));
        agents
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.ctx.records.read().await.get(agent_id).cloned()
    }

    pub async fn live_agent_for_task(&self, task_id: &str) -> Option<AgentRecord> {
        let records = self.ctx.records.read().await;
        records
            .values()
            .find(|r| r.is_live() && r.task_id == task_id)
            .cloned()
    }

    /// Spawn contract: allocate the record, arrange isolation, resolve the
    /// model route, and hand the child to a coordinator task. The returned
    /// id is valid immediately for `get_agent`/`terminate`/`kill`.
    pub async fn spawn(&self, task: &Task, queue: Queue) -> Result<String> {
        let config = self.ctx.config.read().await.clone();

        if self.active_count().await >= config.max_concurrent_agents {
            return Err(CosError::Conflict(format!(
                "concurrency cap reached ({})",
                config.max_concurrent_agents
            )));
        }
        if let Some(existing) = self.live_agent_for_task(&task.id).await {
            return Err(CosError::Conflict(format!(
                "task {} already has live agent {}",
                task.id, existing.id
            )));
        }

        let task_type = self.classifier.classify(task);
        let route = self.router.route(task, &task_type);

        let metadata = AgentMetadata {
            model: route.model.clone(),
            model_tier: Some(route.tier),
            model_reason: Some(route.reason.clone()),
            task_description: task.description.clone(),
            workspace_path: None,
            worktree_branch: None,
        };
        let mut record = AgentRecord::new(task, queue, task_type.clone(), metadata);

        // Attempt counters are recorded before the child exists so the
        // learning invariant attempts >= finishes holds mid-run too.
        self.ctx.learning.on_attempt(&task_type, Some(route.tier)).await?;
        let app = task.app().map(str::to_string);
        if let Some(app) = &app {
            self.ctx.activity.on_attempt(app).await?;
        }

        let source_repo = task
            .metadata
            .get("workspace")
            .and_then(|v| v.as_str())
            .map(PathBuf::from);

        // Isolation is best effort: a worktree failure degrades to running
        // in the source workspace.
        let mut workspace = source_repo.clone().unwrap_or_else(|| PathBuf::from("."));
        if config.use_worktrees {
            if let Some(repo) = &source_repo {
                match self
                    .ctx
                    .worktree
                    .create(&record.id, repo, &task.id, None)
                    .await
                {
                    Ok(info) => {
                        workspace = info.worktree_path.clone();
                        record.metadata.worktree_branch = Some(info.branch_name);
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e,
                              "worktree creation failed, spawning without isolation");
                    }
                }
            }
        }
        record.metadata.workspace_path = Some(workspace.display().to_string());

        let prompt_path = self.ctx.paths.agent_prompt(&record.id);
        persistence::write_json(
            &prompt_path,
            &json!({
                "taskId": task.id,
                "description": task.description,
                "metadata": task.metadata,
            }),
        )
        .await?;

        let command: Vec<String> = config
            .default_agent_command
            .iter()
            .map(|part| {
                part.replace("{promptPath}", &prompt_path.display().to_string())
                    .replace("{workspace}", &workspace.display().to_string())
                    .replace("{model}", &route.model)
            })
            .collect();

        let (control_tx, control_rx) = mpsc::channel(8);
        {
            let mut handles = self.ctx.handles.write().await;
            handles.insert(
                record.id.clone(),
                AgentHandle {
                    control: control_tx,
                    source_repo,
                    app,
                },
            );
        }
        self.ctx.store_record(&record).await;
        self.ctx.persist_live().await;

        let agent_id = record.id.clone();
        info!(agent_id = %agent_id, task_id = %task.id, model = %route.model,
              tier = %route.tier, "spawning agent");

        let spec = SpawnSpec {
            record,
            command,
            workspace,
            grace: Duration::from_millis(config.graceful_terminate_ms),
            output_budget: config.output_buffer_bytes,
            max_rss_mb: config.max_process_memory_mb,
        };
        tokio::spawn(agent::run_agent(self.ctx.clone(), spec, control_rx));

        Ok(agent_id)
    }

    async fn send_control(&self, agent_id: &str, msg: ControlMsg) -> Result<()> {
        let record = self
            .get_agent(agent_id)
            .await
            .ok_or_else(|| CosError::NotFound(format!("agent {agent_id}")))?;
        if !record.is_live() {
            return Err(CosError::Conflict(format!("agent {agent_id} already completed")));
        }
        let sender = self
            .ctx
            .handle_sender(agent_id)
            .await
            .ok_or_else(|| CosError::NotFound(format!("agent {agent_id} has no coordinator")))?;
        sender
            .send(msg)
            .await
            .map_err(|_| CosError::Conflict(format!("agent {agent_id} is shutting down")))
    }

    /// Graceful stop: SIGTERM, then SIGKILL after the grace window.
    pub async fn terminate(&self, agent_id: &str) -> Result<()> {
        self.send_control(agent_id, ControlMsg::Terminate).await
    }

    /// Immediate SIGKILL.
    pub async fn kill(&self, agent_id: &str) -> Result<()> {
        self.send_control(agent_id, ControlMsg::Kill).await
    }

    /// Remove one completed agent from memory and from its day shard.
    pub async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        let record = self
            .get_agent(agent_id)
            .await
            .ok_or_else(|| CosError::NotFound(format!("agent {agent_id}")))?;
        if record.is_live() {
            return Err(CosError::Conflict(format!(
                "agent {agent_id} is live; terminate it first"
            )));
        }

        self.ctx.records.write().await.remove(agent_id);
        if let Some(date) = record.completed_at.map(|at| at.date_naive()) {
            let shard = self.ctx.paths.agent_shard(date);
            let mut entries: Vec<AgentRecord> = persistence::read_json(&shard, Vec::new()).await;
            entries.retain(|r| r.id != agent_id);
            if let Err(e) = persistence::write_json(&shard, &entries).await {
                warn!(agent_id, error = %e, "failed to rewrite shard after delete");
            }
        }
        Ok(())
    }

    /// Drop all completed agents from memory. Returns how many were
    /// removed; a second call right after returns zero.
    pub async fn clear_completed(&self) -> usize {
        let mut records = self.ctx.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.is_live());
        before - records.len()
    }

    pub async fn agent_stats(&self) -> AgentStats {
        let records = self.ctx.records.read().await;
        let mut stats = AgentStats {
            total: records.len(),
            live: 0,
            completed: 0,
            succeeded: 0,
            failed: 0,
            avg_duration_ms: 0.0,
        };
        let mut duration_total = 0u64;
        for record in records.values() {
            if record.is_live() {
                stats.live += 1;
                continue;
            }
            stats.completed += 1;
            if let Some(result) = &record.result {
                if result.success {
                    stats.succeeded += 1;
                } else {
                    stats.failed += 1;
                }
                duration_total += result.duration_ms;
            }
        }
        if stats.completed > 0 {
            stats.avg_duration_ms = duration_total as f64 / stats.completed as f64;
        }
        stats
    }

    /// Post-feedback is the one mutation allowed on a completed record.
    pub async fn set_feedback(&self, agent_id: &str, feedback: String) -> Result<()> {
        let mut record = self
            .get_agent(agent_id)
            .await
            .ok_or_else(|| CosError::NotFound(format!("agent {agent_id}")))?;
        if record.is_live() {
            return Err(CosError::Conflict(format!(
                "agent {agent_id} has not completed yet"
            )));
        }
        record.feedback = Some(feedback);
        self.ctx.store_record(&record).await;
        self.ctx.append_to_shard(&record).await;
        Ok(())
    }

    /// Boot-time reconciliation: records left in `live.json` by a previous
    /// process have no coordinator anymore. Live pids are force-killed;
    /// either way the record completes as a zombie and its task is freed.
    pub async fn recover_orphans(&self) -> usize {
        let live: Vec<AgentRecord> =
            persistence::read_json(&self.ctx.paths.live_agents(), Vec::new()).await;
        let mut recovered = 0;

        for mut record in live {
            if let Some(pid) = record.pid {
                if self.ctx.monitor.is_alive(pid).await {
                    warn!(agent_id = %record.id, pid, "killing orphaned agent process");
                    force_kill_pid(pid);
                }
            }

            record.status = AgentStatus::Completed;
            record.completed_at = Some(Utc::now());
            record.result = Some(AgentResult {
                success: false,
                error: Some("zombie".to_string()),
                duration_ms: record.duration_ms(),
                exit_code: None,
            });

            self.ctx.store_record(&record).await;
            self.ctx.append_to_shard(&record).await;
            if let Err(e) = self
                .ctx
                .tasks
                .release(record.queue, &record.task_id, false)
                .await
            {
                debug!(agent_id = %record.id, error = %e, "orphan task release failed");
            }
            self.ctx.publish_health_issue(
                "agent",
                IssueKind::Warning,
                Some("warning"),
                format!("agent {} recovered as zombie after restart", record.id),
            );
            recovered += 1;
        }

        self.ctx.persist_live().await;
        if recovered > 0 {
            info!(count = recovered, "recovered orphaned agents");
        }
        recovered
    }

    /// Process-wide drain: ask every live agent to terminate, wait up to
    /// the drain budget, then force-kill stragglers.
    pub async fn shutdown(&self) {
        let drain_ms = self.ctx.config.read().await.shutdown_drain_ms;
        let live: Vec<String> = {
            let records = self.ctx.records.read().await;
            records.values().filter(|r| r.is_live()).map(|r| r.id.clone()).collect()
        };
        if live.is_empty() {
            return;
        }

        info!(agents = live.len(), "terminating live agents for shutdown");
        for id in &live {
            if let Err(e) = self.terminate(id).await {
                debug!(agent_id = %id, error = %e, "terminate during shutdown failed");
            }
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(drain_ms);
        while tokio::time::Instant::now() < deadline {
            if self.active_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        warn!("drain budget exhausted, force-killing stragglers");
        for id in &live {
            let _ = self.kill(id).await;
        }
        // Give the kill path a moment to run its completion pipeline.
        let hard_stop = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < hard_stop {
            if self.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Scheduler-facing snapshot of which task ids are claimed by live
    /// agents.
    pub async fn claimed_task_ids(&self) -> std::collections::HashSet<String> {
        let records = self.ctx.records.read().await;
        records
            .values()
            .filter(|r| r.is_live())
            .map(|r| r.task_id.clone())
            .collect()
    }
}

fn force_kill_pid(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %e, "SIGKILL delivery failed");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}
