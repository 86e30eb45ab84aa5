//! Task classification and model routing policies.
//!
//! Both are replaceable behind single traits: classification turns a
//! free-text description into a task type, routing picks a model tier for
//! a task. The defaults are keyword policies; anything smarter can be
//! swapped in without touching the supervisor.

use crate::models::{ModelTier, Priority, Task};
use regex::Regex;

/// Maps a task to its task-type string used for learning stats and the
/// skip-list.
pub trait TaskClassifier: Send + Sync {
    fn classify(&self, task: &Task) -> String;
}

/// Picks the model (and tier) an agent should run with.
pub trait ModelRouter: Send + Sync {
    fn route(&self, task: &Task, task_type: &str) -> ModelRoute;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRoute {
    pub model: String,
    pub tier: ModelTier,
    pub reason: String,
}

/// Keyword classifier over the task description. An explicit
/// `taskType` metadata entry always wins; otherwise the first matching
/// category in a fixed precedence order is used.
pub struct KeywordClassifier {
    rules: Vec<(&'static str, Regex)>,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        // Precedence matters: "Fix typo in readme" must land on
        // documentation, not bugfix, so documentation is checked first.
        let rules = [
            ("security", r"(?i)\b(security|vulnerability|cve|exploit|auth)\b"),
            ("architecture", r"(?i)\b(architecture|architect|refactor|redesign|migration)\b"),
            ("database", r"(?i)\b(database|schema|sql|index|query)\b"),
            ("formatting", r"(?i)\b(format|formatting|lint|style|whitespace)\b"),
            ("documentation", r"(?i)\b(readme|docs?|documentation|typo|changelog|comment)\b"),
            ("testing", r"(?i)\b(tests?|testing|coverage|flaky)\b"),
            ("bugfix", r"(?i)\b(fix|bug|crash|broken|regression)\b"),
            ("feature", r"(?i)\b(add|implement|create|build|support)\b"),
        ];
        Self {
            rules: rules
                .into_iter()
                .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (name, re)))
                .collect(),
        }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskClassifier for KeywordClassifier {
    fn classify(&self, task: &Task) -> String {
        if let Some(explicit) = task.task_type_override() {
            return explicit.to_string();
        }
        for (name, pattern) in &self.rules {
            if pattern.is_match(&task.description) {
                return (*name).to_string();
            }
        }
        "general".to_string()
    }
}

/// Default tier policy: critical tasks and architecture/database work get
/// the heavy model, mechanical cleanup gets the light one, everything else
/// runs medium. Task metadata can pin an exact model.
pub struct DefaultModelRouter {
    pub heavy_model: String,
    pub medium_model: String,
    pub light_model: String,
}

impl DefaultModelRouter {
    pub fn new() -> Self {
        Self {
            heavy_model: "claude-3-opus-20240229".to_string(),
            medium_model: "claude-3-5-sonnet-20241022".to_string(),
            light_model: "claude-3-5-haiku-20241022".to_string(),
        }
    }

    fn model_for(&self, tier: ModelTier) -> String {
        match tier {
            ModelTier::Heavy => self.heavy_model.clone(),
            ModelTier::Medium => self.medium_model.clone(),
            ModelTier::Light => self.light_model.clone(),
        }
    }
}

impl Default for DefaultModelRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRouter for DefaultModelRouter {
    fn route(&self, task: &Task, task_type: &str) -> ModelRoute {
        if let Some(model) = task.model_override() {
            return ModelRoute {
                model: model.to_string(),
                tier: ModelTier::Medium,
                reason: "explicit model override in task metadata".to_string(),
            };
        }

        let (tier, reason) = if task.priority == Priority::Critical {
            (ModelTier::Heavy, "critical priority".to_string())
        } else if matches!(task_type, "architecture" | "database") {
            (ModelTier::Heavy, format!("{task_type} work routes heavy"))
        } else if matches!(task_type, "formatting" | "typo") {
            (ModelTier::Light, format!("{task_type} work routes light"))
        } else {
            (ModelTier::Medium, "default tier".to_string())
        };

        ModelRoute {
            model: self.model_for(tier),
            tier,
            reason,
        }
    }
}
