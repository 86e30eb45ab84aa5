//! Engine facade: constructs and wires the stores, supervisor, and
//! scheduler, and exposes the control surface callers use.
//!
//! Everything is an explicit long-lived object injected through this
//! handle; there are no ambient globals, so tests construct a fresh engine
//! per case against a throwaway data root.

use crate::{
    activity::ActivityStore,
    config::Config,
    events::{Event, EventBus, Topic},
    learning::{DurationSummary, LearningRecord, LearningStore},
    models::{AgentRecord, Queue, Task},
    monitor::ProcessMonitor,
    persistence::{self, DataPaths},
    productivity::{Insights, ProductivityStore, ProductivitySummary, Trends},
    routing::{DefaultModelRouter, KeywordClassifier, ModelRouter, TaskClassifier},
    scheduler::{HealthReport, Scheduler, SchedulerStatus},
    supervisor::{AgentStats, AgentSupervisor},
    tasks::{watcher::TaskFileWatcher, Position, TaskStore},
    worktree::{WorktreeManager, WorkspaceProvider},
    Result,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct CosEngine {
    paths: DataPaths,
    config: Arc<RwLock<Config>>,
    bus: EventBus,
    tasks: TaskStore,
    learning: LearningStore,
    productivity: ProductivityStore,
    activity: ActivityStore,
    supervisor: AgentSupervisor,
    scheduler: Scheduler,
    _watcher: Option<TaskFileWatcher>,
}

impl CosEngine {
    /// Build and wire the full engine under `data_root`, recover any agents
    /// orphaned by a previous process, and begin watching the task files.
    /// The scheduler does not start until `start()` (or autoStart in main).
    pub async fn new(data_root: &Path) -> Result<Self> {
        Self::with_policies(
            data_root,
            Arc::new(KeywordClassifier::new()),
            Arc::new(DefaultModelRouter::new()),
        )
        .await
    }

    /// Same as `new`, with replaceable classification and routing policies.
    pub async fn with_policies(
        data_root: &Path,
        classifier: Arc<dyn TaskClassifier>,
        router: Arc<dyn ModelRouter>,
    ) -> Result<Self> {
        let paths = DataPaths::new(data_root);
        persistence::ensure_dir(&paths.agents_dir()).await?;

        let config = Config::load(&paths).await;
        config.validate()?;
        // Persist the resolved config so defaults become visible/editable.
        config.save(&paths).await?;
        let config = Arc::new(RwLock::new(config));

        let bus = EventBus::new();
        let monitor = ProcessMonitor::new();
        let learning = LearningStore::start(paths.clone()).await;
        let productivity = ProductivityStore::start(paths.clone()).await;
        let activity = ActivityStore::start(paths.clone()).await;

        let tasks = TaskStore::new(&*config.read().await, bus.clone());
        tasks.refresh_all().await;

        let worktree: Arc<dyn WorkspaceProvider> = Arc::new(WorktreeManager::new(paths.clone()));

        let supervisor = AgentSupervisor::new(
            paths.clone(),
            config.clone(),
            bus.clone(),
            monitor.clone(),
            learning.clone(),
            productivity.clone(),
            activity.clone(),
            tasks.clone(),
            worktree,
            classifier.clone(),
            router,
        );
        supervisor.recover_orphans().await;

        let scheduler = Scheduler::new(
            config.clone(),
            tasks.clone(),
            learning.clone(),
            activity.clone(),
            supervisor.clone(),
            monitor,
            bus.clone(),
            classifier,
        );

        let watcher = match TaskFileWatcher::start(tasks.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "task file watcher unavailable, relying on periodic scans");
                None
            }
        };

        info!(data_root = %data_root.display(), "engine initialized");
        Ok(Self {
            paths,
            config,
            bus,
            tasks,
            learning,
            productivity,
            activity,
            supervisor,
            scheduler,
            _watcher: watcher,
        })
    }

    // ---- lifecycle -------------------------------------------------------

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.scheduler.stop().await
    }

    pub async fn pause(&self, reason: impl Into<String>) -> Result<()> {
        self.scheduler.pause(reason).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.scheduler.resume().await
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.scheduler.status().await
    }

    /// Full drain: stop scheduling, terminate agents within the drain
    /// budget, emit the final status.
    pub async fn shutdown(&self) {
        if self.scheduler.is_running().await {
            let _ = self.scheduler.stop().await;
        }
        self.supervisor.shutdown().await;
        let status = self.status().await;
        self.bus.publish(
            Topic::Status,
            serde_json::to_value(&status).unwrap_or_else(|_| json!({"running": false})),
        );
        info!("engine shut down");
    }

    // ---- tasks -----------------------------------------------------------

    pub async fn get_tasks(&self, queue: Queue) -> Vec<Task> {
        self.tasks.list(queue).await
    }

    pub async fn add_task(&self, queue: Queue, task: Task, position: Position) -> Result<Task> {
        self.tasks.add(queue, task, position).await
    }

    pub async fn update_task(
        &self,
        queue: Queue,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<Task> {
        self.tasks.update(queue, id, patch).await
    }

    pub async fn delete_task(&self, queue: Queue, id: &str) -> Result<()> {
        self.tasks.delete(queue, id).await
    }

    pub async fn approve_task(&self, queue: Queue, id: &str) -> Result<Task> {
        self.tasks.approve(queue, id).await
    }

    pub async fn reorder_tasks(&self, queue: Queue, ids: Vec<String>) -> Result<Vec<Task>> {
        self.tasks.reorder(queue, ids).await
    }

    // ---- agents ----------------------------------------------------------

    pub async fn get_agents(&self) -> Vec<AgentRecord> {
        self.supervisor.get_agents().await
    }

    pub async fn get_agent(&self, id: &str) -> Option<AgentRecord> {
        self.supervisor.get_agent(id).await
    }

    pub async fn terminate_agent(&self, id: &str) -> Result<()> {
        self.supervisor.terminate(id).await
    }

    pub async fn kill_agent(&self, id: &str) -> Result<()> {
        self.supervisor.kill(id).await
    }

    pub async fn delete_agent(&self, id: &str) -> Result<()> {
        self.supervisor.delete_agent(id).await
    }

    pub async fn clear_completed(&self) -> usize {
        self.supervisor.clear_completed().await
    }

    pub async fn get_agent_stats(&self) -> AgentStats {
        self.supervisor.agent_stats().await
    }

    pub async fn agent_feedback(&self, id: &str, feedback: String) -> Result<()> {
        self.supervisor.set_feedback(id, feedback).await
    }

    // ---- evaluation & health --------------------------------------------

    pub async fn force_evaluate(&self) {
        self.scheduler.force_evaluate().await
    }

    pub async fn run_health_check(&self) -> HealthReport {
        self.scheduler.run_health_check().await
    }

    // ---- learning & productivity ----------------------------------------

    pub async fn learning_stats(&self, task_type: &str) -> Option<LearningRecord> {
        self.learning.stats(task_type).await
    }

    pub async fn all_learning_stats(&self) -> HashMap<String, LearningRecord> {
        self.learning.all_stats().await
    }

    pub async fn all_durations(&self) -> Vec<DurationSummary> {
        self.learning.all_durations().await
    }

    pub async fn skipped_task_types(&self) -> Vec<String> {
        self.learning.skipped().await
    }

    pub async fn productivity_summary(&self) -> ProductivitySummary {
        self.productivity.summary().await
    }

    pub async fn productivity_insights(&self) -> Insights {
        self.productivity.insights().await
    }

    pub async fn productivity_trends(&self, days: u32) -> Trends {
        self.productivity.trends(days).await
    }

    pub async fn app_activity(&self) -> HashMap<String, crate::activity::AppActivity> {
        self.activity.all().await
    }

    // ---- configuration & maintenance ------------------------------------

    pub async fn get_config(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Merge a JSON patch into the persisted config and apply it live.
    /// Interval changes take effect on the next tick.
    pub async fn update_config(&self, patch: serde_json::Value) -> Result<Config> {
        let updated = {
            let current = self.config.read().await.clone();
            current.apply_patch(&self.paths, patch).await?
        };
        *self.config.write().await = updated.clone();
        Ok(updated)
    }

    /// Pack old day shards into monthly archives.
    pub async fn archive_old_agents(&self) -> Result<usize> {
        persistence::archive_old_shards(&self.paths).await
    }

    // ---- events ----------------------------------------------------------

    /// Push stream of every event; consumers filter by topic.
    pub fn subscribe_stream(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.bus.subscribe_stream()
    }

    /// Push stream of one topic.
    pub fn subscribe(&self, topic: Topic) -> tokio::sync::mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.bus.subscribe(topic, move |event| {
            // Receiver dropped just means the subscriber went away.
            let _ = tx.send(event.clone());
            Ok(())
        });
        rx
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn data_paths(&self) -> &DataPaths {
        &self.paths
    }
}
