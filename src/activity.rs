//! Per-app activity tracking: attempt counters and cooldown windows.
//!
//! The scheduler refuses to spawn tasks touching an app whose cooldown has
//! not expired. Updates flow through the same bounded-channel serial
//! updater shape as the learning and productivity stores.

use crate::{
    constants,
    persistence::{self, DataPaths},
    CosError, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppActivity {
    pub last_review_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub attempts: u64,
    pub successes: u64,
}

impl AppActivity {
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|until| until > now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ActivityState {
    apps: HashMap<String, AppActivity>,
}

enum ActivityMsg {
    Attempt {
        app: String,
    },
    Outcome {
        app: String,
        success: bool,
        cooldown_ms: u64,
        ack: Option<oneshot::Sender<()>>,
    },
}

#[derive(Clone)]
pub struct ActivityStore {
    tx: mpsc::Sender<ActivityMsg>,
    state: Arc<RwLock<ActivityState>>,
}

impl ActivityStore {
    pub async fn start(paths: DataPaths) -> Self {
        let state: ActivityState =
            persistence::read_json(&paths.app_activity(), ActivityState::default()).await;
        let state = Arc::new(RwLock::new(state));
        let (tx, rx) = mpsc::channel(constants::STORE_CHANNEL_CAPACITY);

        tokio::spawn(Self::run_updater(paths, state.clone(), rx));
        Self { tx, state }
    }

    async fn run_updater(
        paths: DataPaths,
        state: Arc<RwLock<ActivityState>>,
        mut rx: mpsc::Receiver<ActivityMsg>,
    ) {
        while let Some(msg) = rx.recv().await {
            let mut ack = None;
            {
                let mut state = state.write().await;
                match msg {
                    ActivityMsg::Attempt { app } => {
                        let entry = state.apps.entry(app).or_default();
                        entry.attempts += 1;
                        entry.last_review_at = Some(Utc::now());
                    }
                    ActivityMsg::Outcome {
                        app,
                        success,
                        cooldown_ms,
                        ack: outcome_ack,
                    } => {
                        let entry = state.apps.entry(app).or_default();
                        if success {
                            entry.successes += 1;
                            entry.cooldown_until = None;
                        } else {
                            entry.cooldown_until =
                                Some(Utc::now() + chrono::Duration::milliseconds(cooldown_ms as i64));
                        }
                        ack = outcome_ack;
                    }
                }
            }
            let snapshot = state.read().await.clone();
            if let Err(e) = persistence::write_json(&paths.app_activity(), &snapshot).await {
                warn!(error = %e, "failed to persist app activity");
            }
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
        debug!("activity updater stopped");
    }

    pub async fn on_attempt(&self, app: &str) -> Result<()> {
        self.tx
            .send(ActivityMsg::Attempt {
                app: app.to_string(),
            })
            .await
            .map_err(|_| CosError::Internal(anyhow::anyhow!("activity updater is gone")))
    }

    /// A failure arms the cooldown; a success clears it.
    pub async fn on_outcome(&self, app: &str, success: bool, cooldown_ms: u64) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(ActivityMsg::Outcome {
                app: app.to_string(),
                success,
                cooldown_ms,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| CosError::Internal(anyhow::anyhow!("activity updater is gone")))?;
        ack_rx
            .await
            .map_err(|_| CosError::Internal(anyhow::anyhow!("activity updater dropped ack")))
    }

    pub async fn get(&self, app: &str) -> Option<AppActivity> {
        self.state.read().await.apps.get(app).cloned()
    }

    pub async fn in_cooldown(&self, app: &str) -> bool {
        self.state
            .read()
            .await
            .apps
            .get(app)
            .map(|a| a.in_cooldown(Utc::now()))
            .unwrap_or(false)
    }

    pub async fn all(&self) -> HashMap<String, AppActivity> {
        self.state.read().await.apps.clone()
    }
}
