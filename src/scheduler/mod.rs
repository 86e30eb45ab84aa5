//! Scheduler / evaluator: the top-level control loop.
//!
//! Each tick snapshots the task queues, consults the learning skip-list and
//! per-app cooldowns, and promotes admissible tasks to agent spawns until
//! the concurrency cap is reached. The scheduler is the sole caller of
//! `AgentSupervisor::spawn`, and it never blocks on agent output; it only
//! reads snapshots.

use crate::{
    activity::ActivityStore,
    config::Config,
    events::{EventBus, Topic},
    learning::LearningStore,
    models::{Queue, Task, TaskStatus},
    monitor::ProcessMonitor,
    routing::TaskClassifier,
    supervisor::AgentSupervisor,
    tasks::TaskStore,
    CosError, Result,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

pub mod health;

pub use health::HealthReport;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    pub active_agents: usize,
    pub max_concurrent_agents: usize,
    pub pending_user_tasks: usize,
    pub pending_internal_tasks: usize,
    pub evaluations: u64,
}

#[derive(Debug, Default)]
struct SchedulerState {
    running: bool,
    paused: bool,
    pause_reason: Option<String>,
    evaluations: u64,
}

#[derive(Clone)]
pub struct Scheduler {
    config: Arc<RwLock<Config>>,
    tasks: TaskStore,
    learning: LearningStore,
    activity: ActivityStore,
    supervisor: AgentSupervisor,
    monitor: ProcessMonitor,
    bus: EventBus,
    classifier: Arc<dyn TaskClassifier>,
    state: Arc<RwLock<SchedulerState>>,
    // One evaluation at a time; a forced evaluation and a tick may race.
    eval_lock: Arc<Mutex<()>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<Config>>,
        tasks: TaskStore,
        learning: LearningStore,
        activity: ActivityStore,
        supervisor: AgentSupervisor,
        monitor: ProcessMonitor,
        bus: EventBus,
        classifier: Arc<dyn TaskClassifier>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            tasks,
            learning,
            activity,
            supervisor,
            monitor,
            bus,
            classifier,
            state: Arc::new(RwLock::new(SchedulerState::default())),
            eval_lock: Arc::new(Mutex::new(())),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Start the evaluation and health loops. Starting twice is a conflict.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.running {
                return Err(CosError::Conflict("scheduler is already running".to_string()));
            }
            state.running = true;
            state.paused = false;
            state.pause_reason = None;
        }
        info!("scheduler started");

        let evaluator = self.clone();
        let mut eval_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let interval_ms = evaluator.config.read().await.evaluation_interval_ms;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
                    _ = eval_shutdown.changed() => break,
                }
                if !evaluator.is_running().await {
                    break;
                }
                evaluator.evaluate().await;
            }
            debug!("evaluation loop stopped");
        });

        let health = self.clone();
        let mut health_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let interval_ms = health.config.read().await.health_check_interval_ms;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
                    _ = health_shutdown.changed() => break,
                }
                if !health.is_running().await {
                    break;
                }
                health.run_health_check().await;
            }
            debug!("health loop stopped");
        });

        self.publish_status().await;
        Ok(())
    }

    /// Stop the loops. The caller drains agents separately via the
    /// supervisor's shutdown.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if !state.running {
                return Err(CosError::Conflict("scheduler is not running".to_string()));
            }
            state.running = false;
        }
        let _ = self.shutdown_tx.send(true);
        info!("scheduler stopped");
        self.publish_status().await;
        Ok(())
    }

    pub async fn pause(&self, reason: impl Into<String>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.paused {
                return Err(CosError::Conflict("scheduler is already paused".to_string()));
            }
            state.paused = true;
            state.pause_reason = Some(reason.into());
        }
        info!("scheduler paused");
        self.publish_status().await;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if !state.paused {
                return Err(CosError::Conflict("scheduler is not paused".to_string()));
            }
            state.paused = false;
            state.pause_reason = None;
        }
        info!("scheduler resumed");
        self.publish_status().await;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }

    pub async fn status(&self) -> SchedulerStatus {
        let (running, paused, pause_reason, evaluations) = {
            let state = self.state.read().await;
            (
                state.running,
                state.paused,
                state.pause_reason.clone(),
                state.evaluations,
            )
        };
        let pending = |tasks: &[Task]| {
            tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Pending)
                .count()
        };
        SchedulerStatus {
            running,
            paused,
            pause_reason,
            active_agents: self.supervisor.active_count().await,
            max_concurrent_agents: self.config.read().await.max_concurrent_agents,
            pending_user_tasks: pending(&self.tasks.list(Queue::User).await),
            pending_internal_tasks: pending(&self.tasks.list(Queue::Internal).await),
            evaluations,
        }
    }

    /// Run one evaluation pass immediately, regardless of the tick timer.
    /// A no-op while stopped or paused; on an empty queue it has no side
    /// effects beyond the status event.
    pub async fn force_evaluate(&self) {
        self.evaluate().await;
    }

    async fn evaluate(&self) {
        let _guard = self.eval_lock.lock().await;
        {
            let state = self.state.read().await;
            if !state.running || state.paused {
                return;
            }
        }

        // Periodic scan: pick up external edits even if the watcher missed
        // them.
        self.tasks.refresh_all().await;

        let config = self.config.read().await.clone();
        let skip_list = self.learning.skipped().await;
        let claimed = self.supervisor.claimed_task_ids().await;
        let now = Utc::now();

        let mut candidates: Vec<(Queue, usize, Task)> = Vec::new();
        let mut skipped_types: Vec<String> = Vec::new();

        for queue in [Queue::User, Queue::Internal] {
            for (index, task) in self.tasks.list(queue).await.into_iter().enumerate() {
                if task.status != TaskStatus::Pending {
                    continue;
                }
                if claimed.contains(&task.id) {
                    continue;
                }
                if !task.approval_satisfied() {
                    continue;
                }

                let task_type = self.classifier.classify(&task);
                if skip_list.contains(&task_type) {
                    skipped_types.push(task_type);
                    continue;
                }

                if let Some(app) = task.app() {
                    if let Some(activity) = self.activity.get(app).await {
                        if activity.in_cooldown(now) {
                            debug!(task_id = %task.id, app, "task held back by app cooldown");
                            continue;
                        }
                    }
                }

                candidates.push((queue, index, task));
            }
        }

        if !skipped_types.is_empty() {
            skipped_types.sort();
            skipped_types.dedup();
            warn!(task_types = ?skipped_types, "tasks withheld by learning skip-list");
            self.bus.publish(
                Topic::Log,
                json!({
                    "level": "warn",
                    "category": "skipped",
                    "taskTypes": skipped_types,
                }),
            );
        }

        // Admission order: priority desc, user queue before internal,
        // manual file order, then age.
        candidates.sort_by(|(qa, ia, ta), (qb, ib, tb)| {
            tb.priority
                .cmp(&ta.priority)
                .then_with(|| queue_rank(*qa).cmp(&queue_rank(*qb)))
                .then_with(|| ia.cmp(ib))
                .then_with(|| ta.created_at.cmp(&tb.created_at))
        });

        let mut active = self.supervisor.active_count().await;
        for (queue, _, task) in candidates {
            if active >= config.max_concurrent_agents {
                break;
            }
            match self.tasks.claim(queue, &task.id, "pending-spawn").await {
                Ok(claimed_task) => match self.supervisor.spawn(&claimed_task, queue).await {
                    Ok(agent_id) => {
                        info!(task_id = %task.id, agent_id = %agent_id, "task promoted to agent");
                        let _ = self
                            .tasks
                            .update(queue, &task.id, json!({"currentAgentId": agent_id}))
                            .await;
                        active += 1;
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "spawn failed, releasing task");
                        let _ = self.tasks.release(queue, &task.id, false).await;
                    }
                },
                Err(e) => {
                    debug!(task_id = %task.id, error = %e, "claim failed, skipping");
                }
            }
        }

        {
            let mut state = self.state.write().await;
            state.evaluations += 1;
        }
        self.publish_status().await;
    }

    /// Enumerate live agents, ping the monitor, publish `health:check`.
    pub async fn run_health_check(&self) -> HealthReport {
        let max_rss_mb = self.config.read().await.max_process_memory_mb;
        let report = health::run_health_check(&self.supervisor, &self.monitor, max_rss_mb).await;
        self.bus.publish(Topic::HealthCheck, report.to_event_payload());
        if !report.issues.is_empty() {
            warn!(issues = report.issues.len(), "health check raised issues");
        }
        report
    }

    async fn publish_status(&self) {
        let status = self.status().await;
        let payload = serde_json::to_value(&status).unwrap_or_else(|_| json!({}));
        self.bus.publish(Topic::Status, payload);
    }
}

fn queue_rank(queue: Queue) -> u8 {
    match queue {
        Queue::User => 0,
        Queue::Internal => 1,
    }
}
