//! YAML definition files
//!
//! ```yaml
//! kinds:
//!   - name: back_office_asset
//!     states: [new, in_use, damaged, retired]
//! transitions:
//!   - name: deploy
//!     kind: back_office_asset
//!     sources: [new]
//!     target: in_use
//!     actions: [assign_owner, notify]
//!     permission: can_run_deploy_transition
//! ```

use crate::models::transition::{ObjectKind, TransitionDefinition};
use crate::transitions::error::TransitionResult;
use crate::transitions::registry::ActionRegistry;
use crate::transitions::store::DefinitionStore;
use crate::transitions::validator::{DefinitionValidator, ValidationResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Object kinds and transitions as written in a definition file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionFile {
    #[serde(default)]
    pub kinds: Vec<ObjectKind>,
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
}

impl DefinitionFile {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse definition YAML")
    }

    /// Read one definition file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read definition file: {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid definition file: {}", path.display()))
    }

    /// Merge every `.yaml`/`.yml` file of a directory, in file name order
    ///
    /// A missing directory yields an empty set of definitions.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut merged = Self::default();
        if !dir.exists() {
            return Ok(merged);
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read definitions directory: {}", dir.display()))?
        {
            let path = entry?.path();
            let is_yaml = matches!(
                path.extension().and_then(|s| s.to_str()),
                Some("yaml") | Some("yml")
            );
            if path.is_file() && is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let file = Self::load(&path)?;
            tracing::debug!(
                path = %path.display(),
                kinds = file.kinds.len(),
                transitions = file.transitions.len(),
                "Loaded definition file"
            );
            merged.kinds.extend(file.kinds);
            merged.transitions.extend(file.transitions);
        }
        Ok(merged)
    }

    /// Report every problem without building a store
    pub fn validate(&self, registry: &ActionRegistry) -> ValidationResult {
        DefinitionValidator::validate_all(&self.kinds, &self.transitions, registry)
    }

    /// Build a definition store, failing on the first invalid definition
    pub fn into_store(self, registry: Arc<ActionRegistry>) -> TransitionResult<DefinitionStore> {
        let mut store = DefinitionStore::new(registry);
        for kind in self.kinds {
            store.register_kind(kind);
        }
        for definition in self.transitions {
            store.create(definition)?;
        }
        Ok(store)
    }
}
