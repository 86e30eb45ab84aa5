mod unit;

use super::AgentSupervisor;
use crate::{
    activity::ActivityStore,
    config::Config,
    events::EventBus,
    learning::LearningStore,
    monitor::ProcessMonitor,
    persistence::DataPaths,
    productivity::ProductivityStore,
    routing::{DefaultModelRouter, KeywordClassifier},
    tasks::TaskStore,
    worktree::WorktreeManager,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub(super) struct Harness {
    pub supervisor: AgentSupervisor,
    pub bus: EventBus,
    pub tasks: TaskStore,
    pub learning: LearningStore,
    pub activity: ActivityStore,
    pub paths: DataPaths,
}

/// Fresh supervisor over a throwaway data root, with the agent command
/// under test control.
pub(super) async fn harness(dir: &Path, command: &[&str], max_concurrent: usize) -> Harness {
    let mut config = Config::default();
    config.user_tasks_path = dir.join("user.json");
    config.internal_tasks_path = dir.join("internal.json");
    config.default_agent_command = command.iter().map(|s| s.to_string()).collect();
    config.max_concurrent_agents = max_concurrent;
    config.graceful_terminate_ms = 1_000;
    config.shutdown_drain_ms = 5_000;

    harness_with_config(dir, config).await
}

pub(super) async fn harness_with_config(dir: &Path, config: Config) -> Harness {
    let paths = DataPaths::new(dir);
    let config = Arc::new(RwLock::new(config));
    let bus = EventBus::new();
    let monitor = ProcessMonitor::new();
    let learning = LearningStore::start(paths.clone()).await;
    let productivity = ProductivityStore::start(paths.clone()).await;
    let activity = ActivityStore::start(paths.clone()).await;
    let tasks = TaskStore::new(&*config.read().await, bus.clone());

    let supervisor = AgentSupervisor::new(
        paths.clone(),
        config,
        bus.clone(),
        monitor,
        learning.clone(),
        productivity,
        activity.clone(),
        tasks.clone(),
        Arc::new(WorktreeManager::new(paths.clone())),
        Arc::new(KeywordClassifier::new()),
        Arc::new(DefaultModelRouter::new()),
    );

    Harness {
        supervisor,
        bus,
        tasks,
        learning,
        activity,
        paths,
    }
}

/// Poll until the agent record reports completed, or panic after the
/// timeout. Child processes in these tests finish in a few seconds at most.
pub(super) async fn wait_for_completion(
    supervisor: &AgentSupervisor,
    agent_id: &str,
) -> crate::models::AgentRecord {
    for _ in 0..150 {
        if let Some(record) = supervisor.get_agent(agent_id).await {
            if !record.is_live() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("agent {agent_id} did not complete in time");
}
