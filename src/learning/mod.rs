//! Learning store: incremental per-task-type statistics.
//!
//! All mutation flows through a bounded channel drained by a single owner
//! task; readers take snapshots and never mutate. A completion message can
//! carry an ack so the supervisor can guarantee stats are applied before it
//! publishes `agent:completed`.
//!
//! Terminology: `completed`/`failed` count successful and failed finishes,
//! `attempts` counts starts, so `attempts >= completed + failed` with the
//! difference being currently-active runs. The skip-list keys off finished
//! runs (`completed + failed`), which is what makes a 100%-failure task type
//! skippable at all.

use crate::{
    constants,
    models::ModelTier,
    persistence::{self, DataPaths},
    CosError, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

/// Per-tier routing counters. Accuracy is successes over finishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TierStats {
    pub attempts: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TierStats {
    pub fn accuracy(&self) -> Option<f64> {
        let finished = self.completed + self.failed;
        (finished > 0).then(|| self.completed as f64 / finished as f64)
    }
}

/// Statistics for one task type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LearningRecord {
    pub attempts: u64,
    pub completed: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
    /// Bounded window of recent finish durations backing the p80 estimate.
    pub durations: VecDeque<u64>,
    /// Bounded window of recent outcomes (true = success) backing the
    /// adaptive cooldown.
    pub recent_outcomes: VecDeque<bool>,
    pub error_categories: HashMap<String, u64>,
    pub model_tier_stats: HashMap<ModelTier, TierStats>,
}

impl LearningRecord {
    pub fn finished(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn success_rate(&self) -> f64 {
        let finished = self.finished();
        if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64
        }
    }

    /// 80th-percentile duration over the recent window. Below the minimum
    /// sample count this falls back to the running mean, which keeps early
    /// progress bars from jumping around.
    pub fn p80_duration_ms(&self) -> Option<u64> {
        if self.finished() == 0 {
            return None;
        }
        if self.durations.len() < constants::P80_MIN_SAMPLES {
            return Some(self.avg_duration_ms.round() as u64);
        }
        let mut sorted: Vec<u64> = self.durations.iter().copied().collect();
        sorted.sort_unstable();
        let index = (0.8 * sorted.len() as f64).ceil() as usize - 1;
        Some(sorted[index.min(sorted.len() - 1)])
    }

    fn record_attempt(&mut self, tier: Option<ModelTier>) {
        self.attempts += 1;
        if let Some(tier) = tier {
            self.model_tier_stats.entry(tier).or_default().attempts += 1;
        }
    }

    fn record_completion(&mut self, outcome: &Completion) {
        let previously_finished = self.finished() as f64;
        if outcome.success {
            self.completed += 1;
        } else {
            self.failed += 1;
            if let Some(category) = &outcome.error_category {
                *self.error_categories.entry(category.clone()).or_insert(0) += 1;
            }
        }

        self.avg_duration_ms = (self.avg_duration_ms * previously_finished
            + outcome.duration_ms as f64)
            / (previously_finished + 1.0);

        self.durations.push_back(outcome.duration_ms);
        while self.durations.len() > constants::DURATION_WINDOW_CAPACITY {
            self.durations.pop_front();
        }
        self.recent_outcomes.push_back(outcome.success);
        while self.recent_outcomes.len() > constants::DURATION_WINDOW_CAPACITY {
            self.recent_outcomes.pop_front();
        }

        if let Some(tier) = outcome.model_tier {
            let stats = self.model_tier_stats.entry(tier).or_default();
            if outcome.success {
                stats.completed += 1;
            } else {
                stats.failed += 1;
            }
        }
    }

    /// Cooldown multiplier in [1, 8], scaled by failure density over the
    /// last ten finishes.
    pub fn cooldown_multiplier(&self) -> f64 {
        let recent: Vec<bool> = self.recent_outcomes.iter().rev().take(10).copied().collect();
        if recent.is_empty() {
            return constants::COOLDOWN_MULTIPLIER_MIN;
        }
        let failures = recent.iter().filter(|ok| !**ok).count() as f64;
        let density = failures / recent.len() as f64;
        (constants::COOLDOWN_MULTIPLIER_MIN
            + density * (constants::COOLDOWN_MULTIPLIER_MAX - constants::COOLDOWN_MULTIPLIER_MIN))
            .clamp(
                constants::COOLDOWN_MULTIPLIER_MIN,
                constants::COOLDOWN_MULTIPLIER_MAX,
            )
    }

    fn should_skip(&self) -> bool {
        self.finished() >= constants::SKIP_MIN_COMPLETED
            && self.success_rate() < constants::SKIP_SUCCESS_RATE_FLOOR
    }
}

/// One finished run, as reported by the supervisor.
#[derive(Debug, Clone)]
pub struct Completion {
    pub success: bool,
    pub duration_ms: u64,
    pub error_category: Option<String>,
    pub model_tier: Option<ModelTier>,
}

/// Duration summary used by dashboards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DurationSummary {
    pub task_type: String,
    pub finished: u64,
    pub avg_duration_ms: f64,
    pub p80_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LearningState {
    records: HashMap<String, LearningRecord>,
}

enum LearningMsg {
    Attempt {
        task_type: String,
        model_tier: Option<ModelTier>,
    },
    Complete {
        task_type: String,
        completion: Completion,
        ack: Option<oneshot::Sender<()>>,
    },
}

#[derive(Clone)]
pub struct LearningStore {
    tx: mpsc::Sender<LearningMsg>,
    state: Arc<RwLock<LearningState>>,
}

impl LearningStore {
    /// Load persisted stats and start the serial updater.
    pub async fn start(paths: DataPaths) -> Self {
        let state: LearningState =
            persistence::read_json(&paths.learning(), LearningState::default()).await;
        let state = Arc::new(RwLock::new(state));
        let (tx, rx) = mpsc::channel(constants::STORE_CHANNEL_CAPACITY);

        tokio::spawn(Self::run_updater(paths, state.clone(), rx));
        Self { tx, state }
    }

    async fn run_updater(
        paths: DataPaths,
        state: Arc<RwLock<LearningState>>,
        mut rx: mpsc::Receiver<LearningMsg>,
    ) {
        while let Some(msg) = rx.recv().await {
            let mut ack = None;
            {
                let mut state = state.write().await;
                match msg {
                    LearningMsg::Attempt {
                        task_type,
                        model_tier,
                    } => {
                        state
                            .records
                            .entry(task_type)
                            .or_default()
                            .record_attempt(model_tier);
                    }
                    LearningMsg::Complete {
                        task_type,
                        completion,
                        ack: completion_ack,
                    } => {
                        state
                            .records
                            .entry(task_type)
                            .or_default()
                            .record_completion(&completion);
                        ack = completion_ack;
                    }
                }
            }

            let snapshot = state.read().await.clone();
            if let Err(e) = persistence::write_json(&paths.learning(), &snapshot).await {
                warn!(error = %e, "failed to persist learning state");
            }
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
        debug!("learning updater stopped");
    }

    /// Record a started run. Fire-and-forget.
    pub async fn on_attempt(&self, task_type: &str, model_tier: Option<ModelTier>) -> Result<()> {
        self.tx
            .send(LearningMsg::Attempt {
                task_type: task_type.to_string(),
                model_tier,
            })
            .await
            .map_err(|_| CosError::Internal(anyhow::anyhow!("learning updater is gone")))
    }

    /// Record a finished run and wait until the update has been applied and
    /// persisted, preserving the updates-before-event ordering guarantee.
    pub async fn on_complete(&self, task_type: &str, completion: Completion) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(LearningMsg::Complete {
                task_type: task_type.to_string(),
                completion,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| CosError::Internal(anyhow::anyhow!("learning updater is gone")))?;
        ack_rx
            .await
            .map_err(|_| CosError::Internal(anyhow::anyhow!("learning updater dropped ack")))
    }

    pub async fn stats(&self, task_type: &str) -> Option<LearningRecord> {
        let state = self.state.read().await;
        state.records.get(task_type).cloned()
    }

    pub async fn all_stats(&self) -> HashMap<String, LearningRecord> {
        self.state.read().await.records.clone()
    }

    pub async fn all_durations(&self) -> Vec<DurationSummary> {
        let state = self.state.read().await;
        let mut summaries: Vec<DurationSummary> = state
            .records
            .iter()
            .map(|(task_type, record)| DurationSummary {
                task_type: task_type.clone(),
                finished: record.finished(),
                avg_duration_ms: record.avg_duration_ms,
                p80_duration_ms: record.p80_duration_ms(),
            })
            .collect();
        summaries.sort_by(|a, b| a.task_type.cmp(&b.task_type));
        summaries
    }

    /// Task types the scheduler should not attempt: enough history, dismal
    /// success rate. A crude circuit breaker.
    pub async fn skipped(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut skipped: Vec<String> = state
            .records
            .iter()
            .filter(|(_, record)| record.should_skip())
            .map(|(task_type, _)| task_type.clone())
            .collect();
        skipped.sort();
        skipped
    }

    /// Cooldown multiplier for one task type, in [1, 8].
    pub async fn adaptive_cooldown(&self, task_type: &str) -> f64 {
        let state = self.state.read().await;
        state
            .records
            .get(task_type)
            .map(|r| r.cooldown_multiplier())
            .unwrap_or(constants::COOLDOWN_MULTIPLIER_MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(success: bool, duration_ms: u64) -> Completion {
        Completion {
            success,
            duration_ms,
            error_category: (!success).then(|| "exit_code".to_string()),
            model_tier: Some(ModelTier::Medium),
        }
    }

    async fn store() -> (LearningStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LearningStore::start(DataPaths::new(dir.path())).await;
        (store, dir)
    }

    #[tokio::test]
    async fn attempt_and_complete_update_counters() {
        let (store, _dir) = store().await;

        store.on_attempt("bugfix", Some(ModelTier::Medium)).await.unwrap();
        store.on_complete("bugfix", completion(true, 2_000)).await.unwrap();

        let stats = store.stats("bugfix").await.unwrap();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        assert!((stats.success_rate() - 1.0).abs() < f64::EPSILON);
        assert!((stats.avg_duration_ms - 2_000.0).abs() < f64::EPSILON);
        assert!(stats.attempts >= stats.completed + stats.failed);
    }

    #[tokio::test]
    async fn failures_track_error_categories() {
        let (store, _dir) = store().await;

        for _ in 0..3 {
            store.on_attempt("security", None).await.unwrap();
            store.on_complete("security", completion(false, 1_000)).await.unwrap();
        }

        let stats = store.stats("security").await.unwrap();
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.error_categories.get("exit_code"), Some(&3));
        assert_eq!(stats.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn p80_falls_back_to_mean_under_five_samples() {
        let (store, _dir) = store().await;

        for duration in [1_000, 2_000, 3_000] {
            store.on_attempt("docs", None).await.unwrap();
            store.on_complete("docs", completion(true, duration)).await.unwrap();
        }

        let stats = store.stats("docs").await.unwrap();
        assert_eq!(stats.p80_duration_ms(), Some(2_000)); // mean of 3 samples
    }

    #[tokio::test]
    async fn p80_uses_sorted_window_index() {
        let (store, _dir) = store().await;

        // 10 samples 100..=1000: p80 index = ceil(0.8*10)-1 = 7 -> 800.
        for duration in (1..=10).map(|n| n * 100) {
            store.on_attempt("feature", None).await.unwrap();
            store.on_complete("feature", completion(true, duration)).await.unwrap();
        }

        let stats = store.stats("feature").await.unwrap();
        assert_eq!(stats.p80_duration_ms(), Some(800));
    }

    #[tokio::test]
    async fn duration_window_is_bounded() {
        let (store, _dir) = store().await;

        for n in 0..(constants::DURATION_WINDOW_CAPACITY as u64 + 20) {
            store.on_attempt("churn", None).await.unwrap();
            store.on_complete("churn", completion(true, n)).await.unwrap();
        }

        let stats = store.stats("churn").await.unwrap();
        assert_eq!(stats.durations.len(), constants::DURATION_WINDOW_CAPACITY);
        // Oldest samples were dropped.
        assert_eq!(*stats.durations.front().unwrap(), 20);
    }

    #[tokio::test]
    async fn skip_list_requires_history_and_low_rate() {
        let (store, _dir) = store().await;

        // Four failures: not enough history yet.
        for _ in 0..4 {
            store.on_attempt("security", None).await.unwrap();
            store.on_complete("security", completion(false, 500)).await.unwrap();
        }
        assert!(store.skipped().await.is_empty());

        // Fifth failure crosses the threshold.
        store.on_attempt("security", None).await.unwrap();
        store.on_complete("security", completion(false, 500)).await.unwrap();
        assert_eq!(store.skipped().await, vec!["security".to_string()]);

        // A healthy type is not skipped.
        for _ in 0..6 {
            store.on_attempt("docs", None).await.unwrap();
            store.on_complete("docs", completion(true, 500)).await.unwrap();
        }
        assert_eq!(store.skipped().await, vec!["security".to_string()]);
    }

    #[tokio::test]
    async fn adaptive_cooldown_scales_with_failure_density() {
        let (store, _dir) = store().await;

        assert_eq!(store.adaptive_cooldown("unknown").await, 1.0);

        for _ in 0..10 {
            store.on_attempt("flaky", None).await.unwrap();
            store.on_complete("flaky", completion(false, 500)).await.unwrap();
        }
        assert_eq!(store.adaptive_cooldown("flaky").await, 8.0);

        // Successes wash the density back down.
        for _ in 0..10 {
            store.on_attempt("flaky", None).await.unwrap();
            store.on_complete("flaky", completion(true, 500)).await.unwrap();
        }
        assert_eq!(store.adaptive_cooldown("flaky").await, 1.0);
    }

    #[tokio::test]
    async fn tier_stats_track_routing_accuracy() {
        let (store, _dir) = store().await;

        store.on_attempt("arch", Some(ModelTier::Heavy)).await.unwrap();
        store
            .on_complete(
                "arch",
                Completion {
                    success: true,
                    duration_ms: 100,
                    error_category: None,
                    model_tier: Some(ModelTier::Heavy),
                },
            )
            .await
            .unwrap();

        let stats = store.stats("arch").await.unwrap();
        let tier = stats.model_tier_stats.get(&ModelTier::Heavy).unwrap();
        assert_eq!(tier.attempts, 1);
        assert_eq!(tier.accuracy(), Some(1.0));
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());

        {
            let store = LearningStore::start(paths.clone()).await;
            store.on_attempt("persisted", None).await.unwrap();
            store.on_complete("persisted", completion(true, 750)).await.unwrap();
        }

        let reloaded = LearningStore::start(paths).await;
        let stats = reloaded.stats("persisted").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert!((stats.avg_duration_ms - 750.0).abs() < f64::EPSILON);
    }
}
