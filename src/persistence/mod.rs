//! Persistence layer: atomic JSON documents under the data root.
//!
//! Every write lands on a sibling temp path and is renamed into place, so a
//! reader never observes a half-written file. There are no cross-file
//! transactions; recovery relies on each file being independently
//! consistent. Callers serialize writes per logical file (one writer per
//! store).

use crate::{constants, error::CosError, Result};
use chrono::{NaiveDate, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Resolved locations of every persisted document, relative to the
/// configured data root.
///
/// ```text
/// <root>/cos
///   /agents/<YYYY-MM-DD>.json   daily shards of completed agents
///   /agents/live.json           currently initializing/running agents
///   /worktrees/<agentId>/       managed git worktrees
///   /archive/                   packed old day shards
///   learning.json  productivity.json  app-activity.json  config.json
/// ```
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
}

impl DataPaths {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            root: data_root.into().join("cos"),
        }
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    pub fn live_agents(&self) -> PathBuf {
        self.agents_dir().join("live.json")
    }

    pub fn agent_shard(&self, date: NaiveDate) -> PathBuf {
        self.agents_dir().join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    /// Prompt document handed to the agent command via `{promptPath}`.
    pub fn agent_prompt(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join("prompts").join(format!("{agent_id}.json"))
    }

    /// Append-only full output log, one JSON object per line.
    pub fn agent_output_log(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join("output").join(format!("{agent_id}.jsonl"))
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn learning(&self) -> PathBuf {
        self.root.join("learning.json")
    }

    pub fn productivity(&self) -> PathBuf {
        self.root.join("productivity.json")
    }

    pub fn app_activity(&self) -> PathBuf {
        self.root.join("app-activity.json")
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.json")
    }
}

/// Create `path` and all missing parents.
pub async fn ensure_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| CosError::io(path.display().to_string(), e))
}

/// Read a JSON document, falling back to `default` on any failure.
///
/// Missing files and parse errors are both normal here: the caller gets the
/// default and a log line, never an error.
pub async fn read_json<T: DeserializeOwned>(path: &Path, default: T) -> T {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unparseable JSON, using default");
                default
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => default,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable file, using default");
            default
        }
    }
}

/// Write a JSON document atomically: pretty-print to `<path>.tmp`, fsync,
/// rename into place. Retried once on failure before surfacing.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    match write_json_once(path, value).await {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!(path = %path.display(), error = %first, "write failed, retrying once");
            write_json_once(path, value).await
        }
    }
}

async fn write_json_once<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }

    let body = serde_json::to_vec_pretty(value)?;
    let tmp = tmp_sibling(path);

    tokio::fs::write(&tmp, &body)
        .await
        .map_err(|e| CosError::io(tmp.display().to_string(), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| CosError::io(path.display().to_string(), e))?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp-{}", std::process::id()));
    path.with_file_name(name)
}

/// Append one record to a JSONL log. Append-heavy callers (full agent
/// output) use this instead of rewriting a document per line.
pub async fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }

    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| CosError::io(path.display().to_string(), e))?;
    file.write_all(&line)
        .await
        .map_err(|e| CosError::io(path.display().to_string(), e))?;
    Ok(())
}

/// Pack day shards older than the retention window into per-month tar.gz
/// archives and delete the originals. Returns the number of shards packed.
pub async fn archive_old_shards(paths: &DataPaths) -> Result<usize> {
    let agents_dir = paths.agents_dir();
    let archive_dir = paths.archive_dir();
    let cutoff = Utc::now().date_naive() - chrono::Duration::days(constants::SHARD_ARCHIVE_AFTER_DAYS);

    let mut stale: Vec<(NaiveDate, PathBuf)> = Vec::new();
    let mut entries = match tokio::fs::read_dir(&agents_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(CosError::io(agents_dir.display().to_string(), e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CosError::io(agents_dir.display().to_string(), e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stem) = name.strip_suffix(".json") else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
            continue; // live.json and anything else non-dated stays put
        };
        if date < cutoff {
            stale.push((date, entry.path()));
        }
    }

    if stale.is_empty() {
        return Ok(0);
    }
    ensure_dir(&archive_dir).await?;

    let packed = stale.len();
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        use flate2::{write::GzEncoder, Compression};

        // Group by month so each archive stays bounded and append-friendly.
        let mut by_month: std::collections::BTreeMap<String, Vec<PathBuf>> = Default::default();
        for (date, path) in stale {
            by_month.entry(date.format("%Y-%m").to_string()).or_default().push(path);
        }

        for (month, shard_paths) in by_month {
            let archive_path = archive_dir.join(format!("agents-{month}.tar.gz"));
            let file = std::fs::File::create(&archive_path)?;
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            for shard in &shard_paths {
                if let Some(name) = shard.file_name() {
                    builder.append_path_with_name(shard, name)?;
                }
            }
            builder.into_inner()?.finish()?;
            for shard in &shard_paths {
                std::fs::remove_file(shard)?;
            }
            debug!(archive = %archive_path.display(), "packed agent shards");
        }
        Ok(())
    })
    .await
    .map_err(|e| CosError::Internal(anyhow::anyhow!("archive task panicked: {e}")))?;

    result.map_err(|e| CosError::io(paths.archive_dir().display().to_string(), e))?;
    info!(count = packed, "archived old agent shards");
    Ok(packed)
}
