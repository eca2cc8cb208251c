//! Variable interpolation for topology files and build environments.
//!
//! Supports variables like:
//! - `${stack.name}` - Stack name
//! - `${commit.id}` - Full commit identifier
//! - `${commit.short_id}` - Short (7 char) commit identifier
//! - `${commit.repository}` - Source repository the commit landed in
//! - `${commit.branch}` - Branch, when the trigger carried one
//! - `${lane.name}` - Pipeline the lane runs
//! - `${lane.stage}` - Current stage name
//! - `${env.VAR_NAME}` - Environment variable
//! - `${resource.key}` - Output of a provisioned resource
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)

use greenlight_core::Outputs;
use greenlight_core::pipeline::CommitEvent;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

/// Namespaces that shadow resource names in `${namespace.key}` lookups.
pub const RESERVED_NAMESPACES: &[&str] = &["stack", "commit", "lane", "env"];

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub stack: StackContext,
    pub commit: CommitContext,
    pub lane: LaneContext,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Outputs of provisioned resources, by resource name
    pub outputs: BTreeMap<String, Outputs>,
}

#[derive(Debug, Clone, Default)]
pub struct StackContext {
    pub name: String,
}

/// Commit context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct CommitContext {
    pub id: String,
    pub short_id: String,
    pub repository: String,
    pub branch: Option<String>,
}

impl From<&CommitEvent> for CommitContext {
    fn from(event: &CommitEvent) -> Self {
        Self {
            id: event.commit.clone(),
            short_id: event.short_commit(),
            repository: event.repository.clone(),
            branch: event.branch.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaneContext {
    pub name: String,
    pub stage: String,
}

// Resource names may contain dashes, so both segments accept them.
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_-]*(?:\.[a-zA-Z_][a-zA-Z0-9_-]*)?)\}").unwrap()
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            self.env.insert(key, value);
        }
    }

    /// Record the outputs of a provisioned resource.
    pub fn set_outputs(&mut self, resource: &str, outputs: Outputs) {
        self.outputs.insert(resource.to_string(), outputs);
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["stack", "name"] => Some(self.stack.name.clone()),

            ["commit", "id"] => Some(self.commit.id.clone()),
            ["commit", "short_id"] => Some(self.commit.short_id.clone()),
            ["commit", "repository"] => Some(self.commit.repository.clone()),
            ["commit", "branch"] => self.commit.branch.clone(),

            ["lane", "name"] => Some(self.lane.name.clone()),
            ["lane", "stage"] => Some(self.lane.stage.clone()),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),

            [ns, _] if RESERVED_NAMESPACES.contains(ns) => None,
            [resource, key] => self
                .outputs
                .get(*resource)
                .and_then(|outputs| outputs.get(*key))
                .cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate variables in a list of strings.
    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn stack(mut self, name: impl Into<String>) -> Self {
        self.ctx.stack.name = name.into();
        self
    }

    pub fn commit(mut self, event: &CommitEvent) -> Self {
        self.ctx.commit = CommitContext::from(event);
        self
    }

    pub fn lane(mut self, name: impl Into<String>, stage: impl Into<String>) -> Self {
        self.ctx.lane = LaneContext {
            name: name.into(),
            stage: stage.into(),
        };
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_process_env(mut self) -> Self {
        self.ctx.populate_env();
        self
    }

    pub fn outputs(mut self, resource: &str, outputs: Outputs) -> Self {
        self.ctx.set_outputs(resource, outputs);
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
