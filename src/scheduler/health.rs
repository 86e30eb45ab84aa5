//! Periodic health check over the live agent set.

use crate::{
    models::{HealthIssue, IssueKind},
    monitor::{ProcessMonitor, ProcessSample},
    supervisor::AgentSupervisor,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub agent_id: String,
    pub task_id: String,
    pub sample: Option<ProcessSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub active_agents: usize,
    pub agents: Vec<AgentHealth>,
    pub issues: Vec<HealthIssue>,
}

impl HealthReport {
    pub fn to_event_payload(&self) -> serde_json::Value {
        json!({
            "metrics": {
                "activeAgents": self.active_agents,
                "agents": self.agents,
            },
            "issues": self.issues,
        })
    }
}

/// Ping the monitor for every live agent and collect structured issues.
/// An inactive pid here is a warning; the per-agent coordinator is the one
/// that escalates it to a kill after consecutive strikes.
pub async fn run_health_check(
    supervisor: &AgentSupervisor,
    monitor: &ProcessMonitor,
    max_rss_mb: u64,
) -> HealthReport {
    let live: Vec<_> = supervisor
        .get_agents()
        .await
        .into_iter()
        .filter(|r| r.is_live())
        .collect();

    let mut agents = Vec::with_capacity(live.len());
    let mut issues = Vec::new();

    for record in &live {
        let sample = match record.pid {
            Some(pid) => Some(monitor.sample(pid).await),
            None => None,
        };

        match &sample {
            Some(s) if !s.active => issues.push(HealthIssue {
                category: "agent".to_string(),
                kind: IssueKind::Warning,
                severity: Some("warning".to_string()),
                message: format!(
                    "agent {} (task {}) reports running but pid {} is not active",
                    record.id, record.task_id, s.pid
                ),
            }),
            Some(s) if s.rss_mb > max_rss_mb as f64 => issues.push(HealthIssue {
                category: "agent".to_string(),
                kind: IssueKind::Warning,
                severity: Some("warning".to_string()),
                message: format!(
                    "agent {} rss {:.0} MB exceeds limit {} MB",
                    record.id, s.rss_mb, max_rss_mb
                ),
            }),
            None => issues.push(HealthIssue {
                category: "agent".to_string(),
                kind: IssueKind::Warning,
                severity: Some("warning".to_string()),
                message: format!("agent {} has no pid recorded", record.id),
            }),
            _ => {}
        }

        agents.push(AgentHealth {
            agent_id: record.id.clone(),
            task_id: record.task_id.clone(),
            sample,
        });
    }

    HealthReport {
        active_agents: live.len(),
        agents,
        issues,
    }
}
