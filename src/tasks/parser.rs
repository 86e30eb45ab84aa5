//! Task-file format: a pretty-printed JSON array of task objects.
//!
//! The contract is round-trip stability: `parse(serialize(tasks)) == tasks`,
//! with fields this version does not model preserved through the `extra`
//! map on `Task`. An empty or whitespace-only file parses as an empty queue.

use crate::{models::Task, CosError, Result};

pub fn parse(content: &str) -> Result<Vec<Task>> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let tasks: Vec<Task> = serde_json::from_str(trimmed)?;

    // Duplicate ids within one file would make every id-addressed
    // operation ambiguous; reject the file rather than guess.
    let mut seen = std::collections::HashSet::new();
    for task in &tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(CosError::Validation(format!(
                "duplicate task id in file: {}",
                task.id
            )));
        }
    }
    Ok(tasks)
}

pub fn serialize(tasks: &[Task]) -> Result<String> {
    Ok(serde_json::to_string_pretty(tasks)?)
}
