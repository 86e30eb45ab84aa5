use super::test_helpers::{engine_in, wait_until};
use crate::{
    models::{Priority, Queue, Task, TaskStatus},
    tasks::Position,
    CosError,
};
use serde_json::json;

#[tokio::test]
async fn start_stop_pause_resume_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path(), |_| {}).await;

    assert!(matches!(engine.stop().await, Err(CosError::Conflict(_))));
    engine.start().await.unwrap();
    assert!(matches!(engine.start().await, Err(CosError::Conflict(_))));

    engine.pause("maintenance window").await.unwrap();
    assert!(matches!(
        engine.pause("again").await,
        Err(CosError::Conflict(_))
    ));
    let status = engine.status().await;
    assert!(status.paused);
    assert_eq!(status.pause_reason.as_deref(), Some("maintenance window"));

    engine.resume().await.unwrap();
    assert!(matches!(engine.resume().await, Err(CosError::Conflict(_))));

    engine.stop().await.unwrap();
    assert!(!engine.status().await.running);
}

#[tokio::test]
async fn force_evaluate_on_empty_queue_has_no_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path(), |_| {}).await;
    engine.start().await.unwrap();

    engine.force_evaluate().await;
    engine.force_evaluate().await;

    assert!(engine.get_agents().await.is_empty());
    assert!(engine.get_tasks(Queue::User).await.is_empty());
    assert!(engine.get_tasks(Queue::Internal).await.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn paused_scheduler_admits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path(), |c| c.max_concurrent_agents = 2).await;

    engine
        .add_task(
            Queue::User,
            Task::new("waits out the pause", Priority::High),
            Position::Bottom,
        )
        .await
        .unwrap();

    engine.start().await.unwrap();
    engine.pause("halted for test").await.unwrap();
    engine.force_evaluate().await;
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(engine.get_agents().await.is_empty());

    engine.resume().await.unwrap();
    engine.force_evaluate().await;
    wait_until!(10, "task ran after resume", {
        engine
            .get_tasks(Queue::User)
            .await
            .first()
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false)
    });

    engine.shutdown().await;
}

#[tokio::test]
async fn health_check_reports_live_agents() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path(), |c| {
        c.default_agent_command = vec!["sleep".into(), "5".into()];
    })
    .await;

    engine
        .add_task(
            Queue::User,
            Task::new("observed task", Priority::Medium),
            Position::Bottom,
        )
        .await
        .unwrap();
    engine.start().await.unwrap();
    engine.force_evaluate().await;
    wait_until!(10, "agent live", {
        engine.get_agent_stats().await.live == 1
    });

    let report = engine.run_health_check().await;
    assert_eq!(report.active_agents, 1);
    assert_eq!(report.agents.len(), 1);
    let sample = report.agents[0].sample.as_ref().unwrap();
    assert!(sample.active);
    assert!(report.issues.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn config_patch_applies_live() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path(), |_| {}).await;

    let updated = engine
        .update_config(json!({"maxConcurrentAgents": 7}))
        .await
        .unwrap();
    assert_eq!(updated.max_concurrent_agents, 7);
    assert_eq!(engine.status().await.max_concurrent_agents, 7);

    // The patch is persisted for the next boot.
    let reloaded = crate::config::Config::load(engine.data_paths()).await;
    assert_eq!(reloaded.max_concurrent_agents, 7);
}

#[tokio::test]
async fn status_counts_pending_per_queue() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path(), |c| c.max_concurrent_agents = 0).await;

    engine
        .add_task(Queue::User, Task::new("u1", Priority::Low), Position::Bottom)
        .await
        .unwrap();
    engine
        .add_task(
            Queue::Internal,
            Task::new("i1", Priority::Low),
            Position::Bottom,
        )
        .await
        .unwrap();
    engine
        .add_task(
            Queue::Internal,
            Task::new("i2", Priority::Low),
            Position::Bottom,
        )
        .await
        .unwrap();

    let status = engine.status().await;
    assert_eq!(status.pending_user_tasks, 1);
    assert_eq!(status.pending_internal_tasks, 2);
    assert!(!status.running);
}

#[tokio::test]
async fn subscribe_topic_filters_events() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path(), |_| {}).await;
    let mut status_rx = engine.subscribe(crate::events::Topic::Status);

    engine.start().await.unwrap();
    engine.force_evaluate().await;

    let event = status_rx.recv().await.unwrap();
    assert_eq!(event.topic, crate::events::Topic::Status);

    engine.shutdown().await;
}
