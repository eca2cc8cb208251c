//! Runtime settings: which backends to use and where to keep state.

use crate::{ConfigError, ConfigResult};
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_STATE_PATH: &str = ".greenlight/state.json";
pub const DEFAULT_BIND: &str = "0.0.0.0:3000";

/// Where build jobs run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorBackend {
    /// Local Docker daemon.
    #[default]
    Docker,
    /// Record invocations without running anything.
    DryRun,
}

impl std::str::FromStr for ExecutorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(ExecutorBackend::Docker),
            "dry-run" => Ok(ExecutorBackend::DryRun),
            _ => Err(format!("Unknown executor backend: {}", s)),
        }
    }
}

/// Where promotions are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterBackend {
    /// The cluster of the current kubeconfig.
    #[default]
    Kubernetes,
    /// In-process cluster that only records operations.
    Memory,
}

impl std::str::FromStr for ClusterBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kubernetes" => Ok(ClusterBackend::Kubernetes),
            "memory" => Ok(ClusterBackend::Memory),
            _ => Err(format!("Unknown cluster backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub executor: ExecutorBackend,
    pub cluster: ClusterBackend,
    /// Kubernetes namespace promotions are applied in.
    pub namespace: String,
    /// JSON file holding provisioning results between runs.
    pub state_path: PathBuf,
    /// Address the HTTP API listens on.
    pub bind: String,
    /// Shared secret for webhook signatures. Unsigned webhooks are accepted when unset.
    pub webhook_secret: Option<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            executor: ExecutorBackend::default(),
            cluster: ClusterBackend::default(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            bind: DEFAULT_BIND.to_string(),
            webhook_secret: None,
        }
    }
}

impl RuntimeSettings {
    /// Defaults overridden by `GREENLIGHT_*` environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        let mut settings = Self::default();

        if let Ok(executor) = std::env::var("GREENLIGHT_EXECUTOR") {
            settings.executor = parse_value("executor", &executor)?;
        }
        if let Ok(cluster) = std::env::var("GREENLIGHT_CLUSTER") {
            settings.cluster = parse_value("cluster", &cluster)?;
        }
        if let Ok(namespace) = std::env::var("GREENLIGHT_NAMESPACE") {
            settings.namespace = namespace;
        }
        if let Ok(state) = std::env::var("GREENLIGHT_STATE") {
            settings.state_path = PathBuf::from(state);
        }
        if let Ok(bind) = std::env::var("GREENLIGHT_BIND") {
            settings.bind = bind;
        }
        settings.webhook_secret = std::env::var("GREENLIGHT_WEBHOOK_SECRET").ok();

        Ok(settings)
    }

    /// Load a settings file on top of the environment. A missing file is not an error.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let settings = Self::from_env()?;
        match std::fs::read_to_string(path) {
            Ok(text) => settings.merge_kdl(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(settings),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply the nodes of a settings document over these settings.
    pub fn merge_kdl(mut self, kdl: &str) -> ConfigResult<Self> {
        let doc: KdlDocument = kdl.parse()?;

        for node in doc.nodes() {
            let field = node.name().value();
            let value = node
                .entries()
                .iter()
                .find(|e| e.name().is_none())
                .and_then(|e| e.value().as_string())
                .map(|s| s.to_string());

            match (field, value) {
                ("executor", Some(v)) => self.executor = parse_value(field, &v)?,
                ("cluster", Some(v)) => self.cluster = parse_value(field, &v)?,
                ("namespace", Some(v)) => self.namespace = v,
                ("state", Some(v)) => self.state_path = PathBuf::from(v),
                ("bind", Some(v)) => self.bind = v,
                ("webhook-secret", Some(v)) => self.webhook_secret = Some(v),
                ("executor" | "cluster" | "namespace" | "state" | "bind" | "webhook-secret", None) => {
                    return Err(ConfigError::MissingField(format!("value for {}", field)));
                }
                _ => {}
            }
        }

        Ok(self)
    }
}

fn parse_value<T: std::str::FromStr<Err = String>>(field: &str, value: &str) -> ConfigResult<T> {
    value.parse().map_err(|message| ConfigError::InvalidValue {
        field: field.to_string(),
        message,
    })
}
