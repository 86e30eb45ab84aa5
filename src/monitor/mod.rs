//! Process monitor: PID liveness, cpu%, and RSS via `sysinfo`.
//!
//! A persistent `System` is kept so consecutive refreshes of the same pid
//! yield cpu deltas over the sample window. `active = false` is a normal
//! return, not an error; the supervisor uses it for zombie detection. A
//! sample is hard-capped at one second so a stuck OS query can never stall
//! the supervision loop.

use crate::constants;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSample {
    pub active: bool,
    pub pid: u32,
    pub state: String,
    pub cpu_percent: f64,
    pub rss_mb: f64,
}

impl ProcessSample {
    pub fn inactive(pid: u32) -> Self {
        Self {
            active: false,
            pid,
            state: "gone".to_string(),
            cpu_percent: 0.0,
            rss_mb: 0.0,
        }
    }
}

#[derive(Clone)]
pub struct ProcessMonitor {
    // Stateless apart from the cpu-sample cache sysinfo keeps per pid.
    system: Arc<Mutex<System>>,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// Sample one pid. Returns within `MONITOR_TIMEOUT_MS` even if the OS
    /// query wedges; the timeout path reports inactive.
    pub async fn sample(&self, pid: u32) -> ProcessSample {
        let system = self.system.clone();
        let query = tokio::task::spawn_blocking(move || sample_blocking(&system, pid));

        match tokio::time::timeout(Duration::from_millis(constants::MONITOR_TIMEOUT_MS), query)
            .await
        {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                warn!(pid, error = %e, "process sample task failed");
                ProcessSample::inactive(pid)
            }
            Err(_) => {
                warn!(pid, "process sample timed out");
                ProcessSample::inactive(pid)
            }
        }
    }

    /// Liveness shortcut used by kill escalation.
    pub async fn is_alive(&self, pid: u32) -> bool {
        self.sample(pid).await.active
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn sample_blocking(system: &Mutex<System>, pid: u32) -> ProcessSample {
    let sysinfo_pid = Pid::from_u32(pid);
    let mut system = match system.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    let refreshed = system.refresh_process_specifics(
        sysinfo_pid,
        ProcessRefreshKind::new().with_cpu().with_memory(),
    );
    if !refreshed {
        return ProcessSample::inactive(pid);
    }

    match system.process(sysinfo_pid) {
        Some(process) => {
            let status = process.status();
            // A defunct process occupies a table slot but is not running;
            // for supervision purposes it is as gone as a missing pid.
            let active = !matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead);
            ProcessSample {
                active,
                pid,
                state: status.to_string(),
                cpu_percent: process.cpu_usage() as f64,
                rss_mb: process.memory() as f64 / (1024.0 * 1024.0),
            }
        }
        None => ProcessSample::inactive(pid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn own_process_is_active() {
        let monitor = ProcessMonitor::new();
        let sample = monitor.sample(std::process::id()).await;
        assert!(sample.active);
        assert_eq!(sample.pid, std::process::id());
        assert!(sample.rss_mb > 0.0);
    }

    #[tokio::test]
    async fn nonexistent_pid_is_inactive_not_an_error() {
        let monitor = ProcessMonitor::new();
        // Pid max on Linux is < 2^22 by default; this one cannot exist.
        let sample = monitor.sample(u32::MAX - 1).await;
        assert!(!sample.active);
        assert_eq!(sample.state, "gone");
    }

    #[tokio::test]
    async fn exited_child_becomes_inactive() {
        let monitor = ProcessMonitor::new();
        let mut child = tokio::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id().expect("child pid");
        child.wait().await.expect("wait");

        // Reaped child: the pid is gone (or at best defunct).
        let sample = monitor.sample(pid).await;
        assert!(!sample.active);
    }

    #[tokio::test]
    async fn is_alive_matches_sample() {
        let monitor = ProcessMonitor::new();
        assert!(monitor.is_alive(std::process::id()).await);
        assert!(!monitor.is_alive(u32::MAX - 1).await);
    }
}
