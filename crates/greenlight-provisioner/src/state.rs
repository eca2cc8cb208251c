//! JSON state file kept between runs.

use crate::provisioner::{ProvisionReport, ProvisionedResource, ResolvedOutput};
use chrono::{DateTime, Utc};
use greenlight_core::access::Grant;
use greenlight_core::provider::ResourceRecord;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StateError> for greenlight_core::Error {
    fn from(err: StateError) -> Self {
        greenlight_core::Error::Internal(err.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFile {
    pub stack: String,
    pub updated_at: Option<DateTime<Utc>>,
    /// Resources in provisioning order.
    pub resources: Vec<ProvisionedResource>,
    pub grants: Vec<Grant>,
    /// Operator outputs resolved at the end of the run.
    pub outputs: Vec<ResolvedOutput>,
}

impl StateFile {
    pub fn from_report(
        stack: impl Into<String>,
        report: &ProvisionReport,
        outputs: Vec<ResolvedOutput>,
    ) -> Self {
        Self {
            stack: stack.into(),
            updated_at: Some(Utc::now()),
            resources: report.resources.clone(),
            grants: report.grants.clone(),
            outputs,
        }
    }

    /// Read a state file. A missing file yields `None`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Option<Self>, StateError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the state file, creating its directory. The file is replaced atomically.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), StateError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Records of ready resources, for seeding a provider.
    pub fn records(&self) -> impl Iterator<Item = (String, ResourceRecord)> + '_ {
        self.resources
            .iter()
            .filter(|r| r.state.is_ready())
            .map(|r| {
                (
                    r.name.clone(),
                    ResourceRecord {
                        kind: r.kind,
                        inputs: r.inputs.clone(),
                        outputs: r.outputs.clone(),
                    },
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenlight_core::access::Capability;
    use greenlight_core::{Outputs, ProvisioningState, ResourceKind};

    fn report() -> ProvisionReport {
        let mut outputs = Outputs::new();
        outputs.insert("uri".to_string(), "registry/ecr".to_string());
        ProvisionReport {
            resources: vec![
                ProvisionedResource {
                    name: "ecr".to_string(),
                    kind: ResourceKind::Registry,
                    state: ProvisioningState::Ready,
                    inputs: Default::default(),
                    outputs,
                },
                ProvisionedResource {
                    name: "cluster".to_string(),
                    kind: ResourceKind::ComputeCluster,
                    state: ProvisioningState::Failed {
                        reason: "boom".to_string(),
                    },
                    inputs: Default::default(),
                    outputs: Outputs::new(),
                },
            ],
            grants: vec![Grant::new("job", "ecr", Capability::PullPush)],
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("greenlight-state-{}", std::process::id()));
        let path = dir.join("nested").join("state.json");

        let state = StateFile::from_report("demo", &report(), vec![]);
        state.save(&path).await.unwrap();

        let loaded = StateFile::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.stack, "demo");
        assert_eq!(loaded.resources, state.resources);
        assert_eq!(loaded.grants, state.grants);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let loaded = StateFile::load("/nonexistent/greenlight/state.json")
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_records_only_include_ready_resources() {
        let state = StateFile::from_report("demo", &report(), vec![]);
        let records: Vec<_> = state.records().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "ecr");
        assert_eq!(records[0].1.outputs["uri"], "registry/ecr");
    }
}
