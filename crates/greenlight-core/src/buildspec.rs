//! Build specifications: staged command scripts run by a build executor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// Build phases in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    PreBuild,
    Build,
    PostBuild,
}

impl PhaseName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::PreBuild => "pre_build",
            PhaseName::Build => "build",
            PhaseName::PostBuild => "post_build",
        }
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pre_build" | "pre-build" => Ok(PhaseName::PreBuild),
            "build" => Ok(PhaseName::Build),
            "post_build" | "post-build" => Ok(PhaseName::PostBuild),
            _ => Err(format!("Unknown build phase: {}", s)),
        }
    }
}

/// One phase: an ordered list of opaque commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPhase {
    pub name: PhaseName,
    pub commands: Vec<String>,
}

impl BuildPhase {
    pub fn new(name: PhaseName, commands: Vec<String>) -> Self {
        Self { name, commands }
    }
}

/// A validated, immutable build specification.
///
/// Phases appear at most once each and in `pre_build`, `build`, `post_build`
/// order. Environment values are already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSpec {
    phases: Vec<BuildPhase>,
    env: BTreeMap<String, String>,
}

impl BuildSpec {
    pub fn new(phases: Vec<BuildPhase>, env: BTreeMap<String, String>) -> Result<Self> {
        for pair in phases.windows(2) {
            if pair[0].name >= pair[1].name {
                return Err(Error::InvalidInput(format!(
                    "build phase '{}' is out of order or repeated after '{}'",
                    pair[1].name, pair[0].name
                )));
            }
        }
        Ok(Self { phases, env })
    }

    pub fn phases(&self) -> &[BuildPhase] {
        &self.phases
    }

    pub fn phase(&self, name: PhaseName) -> Option<&BuildPhase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Render every phase as one `sh` script. Each phase is announced so
    /// executor logs can be split per phase; a failing command stops the script.
    pub fn to_script(&self) -> String {
        let mut script = vec!["set -e".to_string()];
        for phase in &self.phases {
            script.push(format!("echo '[phase] {}'", phase.name));
            script.extend(phase.commands.iter().cloned());
        }
        script.join("\n")
    }
}
