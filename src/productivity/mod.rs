//! Productivity store: per-hour/per-weekday counters, daily history, and
//! streak tracking.
//!
//! Mutation flows through a bounded channel with a single owner, mirroring
//! the learning store. Dates and hours are derived from the completion
//! timestamp in UTC. Daily history is pruned to a 90-day window and never
//! contains future dates.

use crate::{
    constants,
    models::AgentRecord,
    persistence::{self, DataPaths},
    CosError, Result,
};
use chrono::{Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

/// One aggregation bucket (an hour of day, a weekday, or a date).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatternBucket {
    pub tasks: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub avg_duration_ms: f64,
    pub success_rate: f64,
}

impl PatternBucket {
    fn record(&mut self, success: bool, duration_ms: u64) {
        self.tasks += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_duration_ms += duration_ms;
        self.avg_duration_ms = self.total_duration_ms as f64 / self.tasks as f64;
        self.success_rate = self.successes as f64 / self.tasks as f64;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Streaks {
    pub current_daily: u32,
    pub longest_daily: u32,
    pub current_weekly: u32,
    pub longest_weekly: u32,
    pub last_active_date: Option<NaiveDate>,
    /// ISO week id, `YYYY-Wnn`.
    pub last_active_week: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductivityState {
    pub streaks: Streaks,
    pub hourly_patterns: [PatternBucket; 24],
    pub daily_patterns: [PatternBucket; 7],
    /// Keyed by ISO date (`YYYY-MM-DD`); bounded by the retention window.
    pub daily_history: BTreeMap<String, PatternBucket>,
}

/// ISO-8601 week id with year rollover handled by chrono (the Thursday of
/// the week decides the year).
pub fn iso_week_id(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

impl ProductivityState {
    fn apply(&mut self, completed_at: chrono::DateTime<Utc>, success: bool, duration_ms: u64) {
        let today = Utc::now().date_naive();
        // Clock skew could stamp a completion slightly ahead; history must
        // not contain future dates.
        let date = completed_at.date_naive().min(today);
        let hour = completed_at.hour() as usize;
        let weekday = completed_at.weekday().num_days_from_monday() as usize;

        self.hourly_patterns[hour].record(success, duration_ms);
        self.daily_patterns[weekday].record(success, duration_ms);
        self.daily_history
            .entry(date.format("%Y-%m-%d").to_string())
            .or_default()
            .record(success, duration_ms);

        self.update_streaks(date);
        self.prune_history(today);
    }

    fn update_streaks(&mut self, date: NaiveDate) {
        let streaks = &mut self.streaks;

        match streaks.last_active_date {
            Some(last) if date == last => {}
            Some(last) if date == last + Duration::days(1) => streaks.current_daily += 1,
            _ => streaks.current_daily = 1,
        }
        streaks.longest_daily = streaks.longest_daily.max(streaks.current_daily);

        let week = iso_week_id(date);
        match (&streaks.last_active_week, streaks.last_active_date) {
            (Some(last_week), _) if *last_week == week => {}
            (Some(_), Some(last_date))
                if iso_week_id(monday_of(last_date) + Duration::days(7)) == week =>
            {
                streaks.current_weekly += 1;
            }
            _ => streaks.current_weekly = 1,
        }
        streaks.longest_weekly = streaks.longest_weekly.max(streaks.current_weekly);

        streaks.last_active_date = Some(date);
        streaks.last_active_week = Some(week);
    }

    fn prune_history(&mut self, today: NaiveDate) {
        let cutoff = today - Duration::days(constants::DAILY_HISTORY_RETENTION_DAYS);
        let cutoff_key = cutoff.format("%Y-%m-%d").to_string();
        self.daily_history.retain(|key, _| key.as_str() >= cutoff_key.as_str());
    }
}

/// Best-performing hour/day, present only past a minimum sample count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Insights {
    pub best_hour: Option<u32>,
    pub best_hour_success_rate: Option<f64>,
    pub best_day: Option<String>,
    pub best_day_success_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Stable,
    Decreasing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub date: String,
    pub tasks: u64,
    pub success_rate: f64,
    /// Rolling 7-day average task volume ending at this date.
    pub rolling_avg_tasks: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trends {
    pub days: Vec<TrendPoint>,
    pub volume: TrendDirection,
    pub success: TrendDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductivitySummary {
    pub streaks: Streaks,
    pub today: PatternBucket,
    pub total_tasks: u64,
    pub total_successes: u64,
}

struct CompletedMsg {
    completed_at: chrono::DateTime<Utc>,
    success: bool,
    duration_ms: u64,
    ack: Option<oneshot::Sender<()>>,
}

#[derive(Clone)]
pub struct ProductivityStore {
    tx: mpsc::Sender<CompletedMsg>,
    state: Arc<RwLock<ProductivityState>>,
}

impl ProductivityStore {
    pub async fn start(paths: DataPaths) -> Self {
        let state: ProductivityState =
            persistence::read_json(&paths.productivity(), ProductivityState::default()).await;
        let state = Arc::new(RwLock::new(state));
        let (tx, rx) = mpsc::channel(constants::STORE_CHANNEL_CAPACITY);

        tokio::spawn(Self::run_updater(paths, state.clone(), rx));
        Self { tx, state }
    }

    async fn run_updater(
        paths: DataPaths,
        state: Arc<RwLock<ProductivityState>>,
        mut rx: mpsc::Receiver<CompletedMsg>,
    ) {
        while let Some(msg) = rx.recv().await {
            {
                let mut state = state.write().await;
                state.apply(msg.completed_at, msg.success, msg.duration_ms);
            }
            let snapshot = state.read().await.clone();
            if let Err(e) = persistence::write_json(&paths.productivity(), &snapshot).await {
                warn!(error = %e, "failed to persist productivity state");
            }
            if let Some(ack) = msg.ack {
                let _ = ack.send(());
            }
        }
        debug!("productivity updater stopped");
    }

    /// Fold one completed agent into the counters, waiting for the update
    /// to land so `agent:completed` can be published afterwards.
    pub async fn on_task_completed(&self, agent: &AgentRecord) -> Result<()> {
        let Some(completed_at) = agent.completed_at else {
            return Err(CosError::Validation(format!(
                "agent {} has no completion timestamp",
                agent.id
            )));
        };
        let success = agent.result.as_ref().map(|r| r.success).unwrap_or(false);

        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(CompletedMsg {
                completed_at,
                success,
                duration_ms: agent.duration_ms(),
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| CosError::Internal(anyhow::anyhow!("productivity updater is gone")))?;
        ack_rx
            .await
            .map_err(|_| CosError::Internal(anyhow::anyhow!("productivity updater dropped ack")))
    }

    pub async fn summary(&self) -> ProductivitySummary {
        let state = self.state.read().await;
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let totals = state
            .daily_history
            .values()
            .fold((0u64, 0u64), |(tasks, ok), bucket| {
                (tasks + bucket.tasks, ok + bucket.successes)
            });
        ProductivitySummary {
            streaks: state.streaks.clone(),
            today: state.daily_history.get(&today).copied().unwrap_or_default(),
            total_tasks: totals.0,
            total_successes: totals.1,
        }
    }

    /// Best hour and weekday by success rate, subject to a minimum sample
    /// threshold so a single lucky task does not dominate.
    pub async fn insights(&self) -> Insights {
        const DAY_NAMES: [&str; 7] = [
            "Monday",
            "Tuesday",
            "Wednesday",
            "Thursday",
            "Friday",
            "Saturday",
            "Sunday",
        ];
        let state = self.state.read().await;

        let best_hour = state
            .hourly_patterns
            .iter()
            .enumerate()
            .filter(|(_, b)| b.tasks >= constants::INSIGHT_MIN_SAMPLES)
            .max_by(|(_, a), (_, b)| {
                a.success_rate
                    .partial_cmp(&b.success_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        let best_day = state
            .daily_patterns
            .iter()
            .enumerate()
            .filter(|(_, b)| b.tasks >= constants::INSIGHT_MIN_SAMPLES)
            .max_by(|(_, a), (_, b)| {
                a.success_rate
                    .partial_cmp(&b.success_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

        Insights {
            best_hour: best_hour.map(|(h, _)| h as u32),
            best_hour_success_rate: best_hour.map(|(_, b)| b.success_rate),
            best_day: best_day.map(|(d, _)| DAY_NAMES[d].to_string()),
            best_day_success_rate: best_day.map(|(_, b)| b.success_rate),
        }
    }

    /// Day-by-day series over the trailing window with rolling 7-day
    /// averages; direction compares the last 7 days to the 7 before.
    pub async fn trends(&self, days: u32) -> Trends {
        let state = self.state.read().await;
        let today = Utc::now().date_naive();
        let days = days.max(1) as i64;

        let mut series = Vec::with_capacity(days as usize);
        for offset in (0..days).rev() {
            let date = today - Duration::days(offset);
            let key = date.format("%Y-%m-%d").to_string();
            let bucket = state.daily_history.get(&key).copied().unwrap_or_default();

            let mut window_tasks = 0u64;
            for back in 0..7 {
                let w = date - Duration::days(back);
                if let Some(b) = state.daily_history.get(&w.format("%Y-%m-%d").to_string()) {
                    window_tasks += b.tasks;
                }
            }

            series.push(TrendPoint {
                date: key,
                tasks: bucket.tasks,
                success_rate: bucket.success_rate,
                rolling_avg_tasks: window_tasks as f64 / 7.0,
            });
        }

        let window_stats = |start: i64| -> (f64, f64) {
            let mut tasks = 0u64;
            let mut successes = 0u64;
            for back in start..start + 7 {
                let d = today - Duration::days(back);
                if let Some(b) = state.daily_history.get(&d.format("%Y-%m-%d").to_string()) {
                    tasks += b.tasks;
                    successes += b.successes;
                }
            }
            let rate = if tasks == 0 {
                0.0
            } else {
                successes as f64 / tasks as f64
            };
            (tasks as f64 / 7.0, rate)
        };
        let (recent_volume, recent_rate) = window_stats(0);
        let (prior_volume, prior_rate) = window_stats(7);

        Trends {
            days: series,
            volume: classify_delta(recent_volume, prior_volume),
            success: classify_delta(recent_rate, prior_rate),
        }
    }
}

fn classify_delta(recent: f64, prior: f64) -> TrendDirection {
    if prior == 0.0 {
        return if recent > 0.0 {
            TrendDirection::Increasing
        } else {
            TrendDirection::Stable
        };
    }
    let ratio = recent / prior;
    if ratio > 1.10 {
        TrendDirection::Increasing
    } else if ratio < 0.90 {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentMetadata, AgentResult, AgentStatus, Priority, Queue, Task};
    use chrono::TimeZone;

    fn agent_completed_at(at: &str, success: bool) -> AgentRecord {
        let completed_at = at.parse::<chrono::DateTime<Utc>>().unwrap();
        let mut agent = AgentRecord::new(
            &Task::new("streak probe", Priority::Low),
            Queue::User,
            "misc".to_string(),
            AgentMetadata::default(),
        );
        agent.status = AgentStatus::Completed;
        agent.started_at = completed_at - Duration::milliseconds(1_500);
        agent.completed_at = Some(completed_at);
        agent.result = Some(AgentResult {
            success,
            error: None,
            duration_ms: 1_500,
            exit_code: Some(if success { 0 } else { 1 }),
        });
        agent
    }

    async fn store() -> (ProductivityStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProductivityStore::start(DataPaths::new(dir.path())).await;
        (store, dir)
    }

    #[test]
    fn iso_week_ids_handle_year_rollover() {
        // 2024-12-30 is a Monday belonging to ISO week 1 of 2025.
        assert_eq!(iso_week_id(NaiveDate::from_ymd_opt(2024, 12, 30).unwrap()), "2025-W01");
        // 2020-12-31 falls in ISO week 53 of 2020.
        assert_eq!(iso_week_id(NaiveDate::from_ymd_opt(2020, 12, 31).unwrap()), "2020-W53");
        assert_eq!(iso_week_id(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()), "2025-W02");
    }

    #[test]
    fn streak_rollover_scenario() {
        // Gap breaks the daily streak, same day holds it, adjacent day
        // extends it; the longest streak is retained.
        let mut state = ProductivityState::default();
        state.streaks.current_daily = 3;
        state.streaks.longest_daily = 3;
        state.streaks.last_active_date = NaiveDate::from_ymd_opt(2025, 1, 10);
        state.streaks.last_active_week =
            Some(iso_week_id(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()));

        let at = |s: &str| s.parse::<chrono::DateTime<Utc>>().unwrap();
        state.apply(at("2025-01-12T09:00:00Z"), true, 1_000);
        assert_eq!(state.streaks.current_daily, 1);

        state.apply(at("2025-01-12T15:00:00Z"), true, 1_000);
        assert_eq!(state.streaks.current_daily, 1);

        state.apply(at("2025-01-13T09:00:00Z"), true, 1_000);
        assert_eq!(state.streaks.current_daily, 2);
        assert_eq!(state.streaks.longest_daily, 3);
    }

    #[test]
    fn weekly_streak_spans_year_boundary() {
        let mut state = ProductivityState::default();
        let at = |s: &str| s.parse::<chrono::DateTime<Utc>>().unwrap();

        // 2024-12-27 is in 2024-W52; 2024-12-30 is in 2025-W01.
        state.apply(at("2024-12-27T10:00:00Z"), true, 1_000);
        assert_eq!(state.streaks.current_weekly, 1);
        assert_eq!(state.streaks.last_active_week.as_deref(), Some("2024-W52"));

        state.apply(at("2024-12-30T10:00:00Z"), true, 1_000);
        assert_eq!(state.streaks.current_weekly, 2);
        assert_eq!(state.streaks.last_active_week.as_deref(), Some("2025-W01"));

        // Skipping a whole week resets.
        state.apply(at("2025-01-20T10:00:00Z"), true, 1_000);
        assert_eq!(state.streaks.current_weekly, 1);
        assert_eq!(state.streaks.longest_weekly, 2);
    }

    #[test]
    fn patterns_bucket_by_hour_and_weekday() {
        let mut state = ProductivityState::default();
        // 2025-01-08 is a Wednesday.
        let at = Utc.with_ymd_and_hms(2025, 1, 8, 14, 30, 0).unwrap();
        state.apply(at, true, 2_000);
        state.apply(at, false, 4_000);

        let hour = &state.hourly_patterns[14];
        assert_eq!(hour.tasks, 2);
        assert_eq!(hour.successes, 1);
        assert!((hour.avg_duration_ms - 3_000.0).abs() < f64::EPSILON);
        assert!((hour.success_rate - 0.5).abs() < f64::EPSILON);

        let wednesday = &state.daily_patterns[2];
        assert_eq!(wednesday.tasks, 2);
    }

    #[test]
    fn history_is_pruned_to_retention_window() {
        let mut state = ProductivityState::default();
        let today = Utc::now().date_naive();
        let stale = today - Duration::days(constants::DAILY_HISTORY_RETENTION_DAYS + 5);
        state
            .daily_history
            .insert(stale.format("%Y-%m-%d").to_string(), PatternBucket::default());

        state.apply(Utc::now(), true, 1_000);
        assert_eq!(state.daily_history.len(), 1);
        assert!(state
            .daily_history
            .contains_key(&today.format("%Y-%m-%d").to_string()));
    }

    #[test]
    fn future_completions_are_clamped_to_today() {
        let mut state = ProductivityState::default();
        state.apply(Utc::now() + Duration::days(3), true, 1_000);

        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        assert!(state.daily_history.contains_key(&today));
        assert_eq!(state.daily_history.len(), 1);
    }

    #[tokio::test]
    async fn on_task_completed_requires_timestamp() {
        let (store, _dir) = store().await;
        let mut agent = agent_completed_at("2025-01-10T09:00:00Z", true);
        agent.completed_at = None;
        assert!(matches!(
            store.on_task_completed(&agent).await,
            Err(CosError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn summary_reflects_today() {
        let (store, _dir) = store().await;
        let now = Utc::now().to_rfc3339();
        store
            .on_task_completed(&agent_completed_at(&now, true))
            .await
            .unwrap();

        let summary = store.summary().await;
        assert_eq!(summary.today.tasks, 1);
        assert_eq!(summary.total_tasks, 1);
        assert_eq!(summary.streaks.current_daily, 1);
    }

    #[tokio::test]
    async fn insights_enforce_minimum_samples() {
        let (store, _dir) = store().await;
        let now = Utc::now().to_rfc3339();
        store
            .on_task_completed(&agent_completed_at(&now, true))
            .await
            .unwrap();

        // One sample is below the threshold.
        let insights = store.insights().await;
        assert_eq!(insights.best_hour, None);

        for _ in 0..constants::INSIGHT_MIN_SAMPLES {
            store
                .on_task_completed(&agent_completed_at(&now, true))
                .await
                .unwrap();
        }
        let insights = store.insights().await;
        assert!(insights.best_hour.is_some());
        assert_eq!(insights.best_hour_success_rate, Some(1.0));
    }

    #[tokio::test]
    async fn trends_classify_volume_direction() {
        let (store, _dir) = store().await;
        // Ten tasks today, none before: increasing volume.
        let now = Utc::now().to_rfc3339();
        for _ in 0..10 {
            store
                .on_task_completed(&agent_completed_at(&now, true))
                .await
                .unwrap();
        }

        let trends = store.trends(14).await;
        assert_eq!(trends.days.len(), 14);
        assert_eq!(trends.volume, TrendDirection::Increasing);
        let last = trends.days.last().unwrap();
        assert_eq!(last.tasks, 10);
        assert!((last.rolling_avg_tasks - 10.0 / 7.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        let now = Utc::now().to_rfc3339();

        {
            let store = ProductivityStore::start(paths.clone()).await;
            store
                .on_task_completed(&agent_completed_at(&now, true))
                .await
                .unwrap();
        }

        let reloaded = ProductivityStore::start(paths).await;
        assert_eq!(reloaded.summary().await.total_tasks, 1);
    }
}
