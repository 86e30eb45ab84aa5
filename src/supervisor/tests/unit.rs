use super::*;
use crate::{
    events::Topic,
    models::{AgentStatus, Priority, Queue, Task},
    persistence,
    CosError,
};

#[tokio::test]
async fn echo_agent_completes_successfully() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["echo", "hello"], 3).await;

    let task = Task::new("Fix typo in readme", Priority::Low);
    let agent_id = h.supervisor.spawn(&task, Queue::User).await.unwrap();
    let record = wait_for_completion(&h.supervisor, &agent_id).await;

    assert_eq!(record.status, AgentStatus::Completed);
    let result = record.result.as_ref().unwrap();
    assert!(result.success);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.error.is_none());
    assert!(record.output.iter().any(|l| l.line == "hello"));
    assert_eq!(record.task_type, "documentation");
    assert!(record.completed_at.unwrap() >= record.started_at);
}

#[tokio::test]
async fn event_sequence_is_spawned_output_completed() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["echo", "hello"], 3).await;
    let mut rx = h.bus.subscribe_stream();

    let task = Task::new("Fix typo in readme", Priority::Low);
    let agent_id = h.supervisor.spawn(&task, Queue::User).await.unwrap();
    wait_for_completion(&h.supervisor, &agent_id).await;

    let mut sequence = Vec::new();
    while let Ok(event) = rx.try_recv() {
        let for_agent = event
            .payload
            .get("agentId")
            .and_then(|v| v.as_str())
            .map(|id| id == agent_id)
            .unwrap_or(false);
        if for_agent {
            sequence.push(event.topic);
        }
    }

    assert_eq!(sequence.first(), Some(&Topic::AgentSpawned));
    assert_eq!(sequence.last(), Some(&Topic::AgentCompleted));
    let output_count = sequence.iter().filter(|t| **t == Topic::AgentOutput).count();
    assert!(output_count >= 1);
    // Nothing after completed, and exactly one of each terminal event.
    assert_eq!(sequence.iter().filter(|t| **t == Topic::AgentSpawned).count(), 1);
    assert_eq!(sequence.iter().filter(|t| **t == Topic::AgentCompleted).count(), 1);
}

#[tokio::test]
async fn completion_updates_learning_before_event() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["echo", "hello"], 3).await;
    let mut rx = h.bus.subscribe_stream();

    let task = Task::new("Fix typo in readme", Priority::Low);
    let agent_id = h.supervisor.spawn(&task, Queue::User).await.unwrap();
    wait_for_completion(&h.supervisor, &agent_id).await;

    // By the time agent:completed is observable, the learning stats for the
    // task type are already applied.
    let mut saw_completed = false;
    while let Ok(event) = rx.try_recv() {
        if event.topic == Topic::AgentCompleted {
            saw_completed = true;
            let stats = h.learning.stats("documentation").await.unwrap();
            assert_eq!(stats.attempts, 1);
            assert_eq!(stats.completed, 1);
            assert!((stats.success_rate() - 1.0).abs() < f64::EPSILON);
        }
    }
    assert!(saw_completed);
}

#[tokio::test]
async fn nonexistent_binary_records_spawn_failure() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["/nonexistent/binary/for-sure"], 3).await;

    let task = Task::new("doomed task", Priority::Low);
    let agent_id = h.supervisor.spawn(&task, Queue::User).await.unwrap();
    let record = wait_for_completion(&h.supervisor, &agent_id).await;

    let result = record.result.as_ref().unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("spawn_failed"));
    assert_eq!(result.exit_code, None);
}

#[tokio::test]
async fn nonzero_exit_is_recorded_with_code() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["false"], 3).await;

    let task = Task::new("failing task", Priority::Low);
    let agent_id = h.supervisor.spawn(&task, Queue::User).await.unwrap();
    let record = wait_for_completion(&h.supervisor, &agent_id).await;

    let result = record.result.as_ref().unwrap();
    assert!(!result.success);
    assert_eq!(result.exit_code, Some(1));
    assert!(result.error.as_deref().unwrap().starts_with("exit code 1"));
}

#[tokio::test]
async fn terminate_escalates_and_records_signal() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["sleep", "30"], 3).await;

    let task = Task::new("long running task", Priority::Low);
    let agent_id = h.supervisor.spawn(&task, Queue::User).await.unwrap();

    // Give the child a moment to actually start.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    h.supervisor.terminate(&agent_id).await.unwrap();

    let record = wait_for_completion(&h.supervisor, &agent_id).await;
    let result = record.result.as_ref().unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("terminated"));
    // sleep dies on SIGTERM; the recorded exit code is the signal number.
    assert_eq!(result.exit_code, Some(15));
}

#[tokio::test]
async fn kill_is_immediate() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["sleep", "30"], 3).await;

    let task = Task::new("kill me", Priority::Low);
    let agent_id = h.supervisor.spawn(&task, Queue::User).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let started = std::time::Instant::now();
    h.supervisor.kill(&agent_id).await.unwrap();
    let record = wait_for_completion(&h.supervisor, &agent_id).await;

    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    let result = record.result.as_ref().unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("terminated"));
    assert_eq!(result.exit_code, Some(9));
}

#[tokio::test]
async fn concurrency_cap_rejects_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["sleep", "10"], 1).await;

    let first = Task::new("first", Priority::Low);
    h.supervisor.spawn(&first, Queue::User).await.unwrap();

    let second = Task::new("second", Priority::Low);
    let err = h.supervisor.spawn(&second, Queue::User).await.unwrap_err();
    assert!(matches!(err, CosError::Conflict(_)));

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn duplicate_task_spawn_is_a_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["sleep", "10"], 3).await;

    let task = Task::new("single claimant", Priority::Low);
    h.supervisor.spawn(&task, Queue::User).await.unwrap();
    let err = h.supervisor.spawn(&task, Queue::User).await.unwrap_err();
    assert!(matches!(err, CosError::Conflict(_)));

    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn control_of_unknown_or_completed_agents_errors() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["echo", "x"], 3).await;

    assert!(matches!(
        h.supervisor.terminate("ghost").await,
        Err(CosError::NotFound(_))
    ));

    let task = Task::new("short lived", Priority::Low);
    let agent_id = h.supervisor.spawn(&task, Queue::User).await.unwrap();
    wait_for_completion(&h.supervisor, &agent_id).await;

    assert!(matches!(
        h.supervisor.terminate(&agent_id).await,
        Err(CosError::Conflict(_))
    ));
    assert!(matches!(
        h.supervisor.kill(&agent_id).await,
        Err(CosError::Conflict(_))
    ));
}

#[tokio::test]
async fn clear_completed_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["echo", "x"], 3).await;

    for n in 0..3 {
        let task = Task::new(format!("task {n}"), Priority::Low);
        let id = h.supervisor.spawn(&task, Queue::User).await.unwrap();
        wait_for_completion(&h.supervisor, &id).await;
    }

    assert_eq!(h.supervisor.clear_completed().await, 3);
    assert_eq!(h.supervisor.clear_completed().await, 0);
}

#[tokio::test]
async fn delete_agent_guards_live_and_rewrites_shard() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["sleep", "10"], 3).await;

    let live_task = Task::new("still running", Priority::Low);
    let live_id = h.supervisor.spawn(&live_task, Queue::User).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(matches!(
        h.supervisor.delete_agent(&live_id).await,
        Err(CosError::Conflict(_))
    ));
    h.supervisor.kill(&live_id).await.unwrap();
    let record = wait_for_completion(&h.supervisor, &live_id).await;

    h.supervisor.delete_agent(&live_id).await.unwrap();
    assert!(h.supervisor.get_agent(&live_id).await.is_none());

    let shard = h
        .paths
        .agent_shard(record.completed_at.unwrap().date_naive());
    let entries: Vec<crate::models::AgentRecord> =
        persistence::read_json(&shard, Vec::new()).await;
    assert!(entries.iter().all(|r| r.id != live_id));
}

#[tokio::test]
async fn feedback_allowed_only_after_completion() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["echo", "x"], 3).await;

    let task = Task::new("feedback target", Priority::Low);
    let agent_id = h.supervisor.spawn(&task, Queue::User).await.unwrap();
    let _ = wait_for_completion(&h.supervisor, &agent_id).await;

    h.supervisor
        .set_feedback(&agent_id, "solid work".to_string())
        .await
        .unwrap();
    let record = h.supervisor.get_agent(&agent_id).await.unwrap();
    assert_eq!(record.feedback.as_deref(), Some("solid work"));
}

#[tokio::test]
async fn agent_stats_aggregate() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), &["echo", "x"], 3).await;

    for n in 0..2 {
        let task = Task::new(format!("ok {n}"), Priority::Low);
        let id = h.supervisor.spawn(&task, Queue::User).await.unwrap();
        wait_for_completion(&h.supervisor, &id).await;
    }

    let stats = h.supervisor.agent_stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.live, 0);
}
