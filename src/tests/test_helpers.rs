use crate::{config::Config, engine::CosEngine, persistence::DataPaths};
use std::path::Path;

/// Build an engine over `dir` with a config tailored by `customize`.
/// The config is persisted first so `CosEngine::new` picks it up exactly
/// as a real deployment would.
pub async fn engine_in(dir: &Path, customize: impl FnOnce(&mut Config)) -> CosEngine {
    let paths = DataPaths::new(dir);
    let mut config = Config::default();
    config.user_tasks_path = dir.join("user.json");
    config.internal_tasks_path = dir.join("internal.json");
    config.default_agent_command = vec!["echo".to_string(), "hello".to_string()];
    config.max_concurrent_agents = 1;
    customize(&mut config);
    config.save(&paths).await.unwrap();

    CosEngine::new(dir).await.unwrap()
}

/// Poll an async condition every 100 ms until it holds, panicking after the
/// timeout. A macro so the condition can borrow test locals freely.
macro_rules! wait_until {
    ($timeout_secs:expr, $what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs($timeout_secs);
        loop {
            if $cond {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for: {}", $what);
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }};
}
pub(crate) use wait_until;
