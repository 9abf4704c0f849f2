//! Flow definition loader
//!
//! Load flow definitions from YAML or JSON files.

use std::path::Path;

use super::FlowDefinition;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },

    #[error("JSON parse error in {file}: {error}")]
    Json {
        file: String,
        error: serde_json::Error,
    },

    #[error("Invalid value in {file}: {message}")]
    Invalid { file: String, message: String },
}

pub struct FlowLoader;

impl FlowLoader {
    /// Load every `.yaml`, `.yml` and `.json` flow in a directory, keyed by
    /// the flow name or, when unnamed, the file stem.
    pub fn load_directory(dir: &Path) -> Result<Vec<(String, FlowDefinition)>, LoadError> {
        let mut flows = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }

            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            // Skip session config - it's not a flow
            if filename == "session.yaml" || filename == "session.yml" {
                continue;
            }

            let ext = path.extension().and_then(|e| e.to_str());
            if matches!(ext, Some("yaml") | Some("yml") | Some("json")) {
                let flow = Self::load_file(&path)?;
                let id = flow.name.clone().unwrap_or_else(|| {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or_default()
                        .to_string()
                });
                flows.push((id, flow));
            }
        }

        flows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(flows)
    }

    /// Load a single flow; `.json` files are parsed as JSON, anything else as YAML
    pub fn load_file(path: &Path) -> Result<FlowDefinition, LoadError> {
        let content = std::fs::read_to_string(path)?;
        let file = path.display().to_string();

        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(|error| LoadError::Json { file, error })
        } else {
            serde_yaml::from_str(&content).map_err(|error| LoadError::Yaml { file, error })
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<FlowDefinition, LoadError> {
        serde_yaml::from_str(content).map_err(|error| LoadError::Yaml {
            file: "<inline>".to_string(),
            error,
        })
    }

    pub fn from_json_str(content: &str) -> Result<FlowDefinition, LoadError> {
        serde_json::from_str(content).map_err(|error| LoadError::Json {
            file: "<inline>".to_string(),
            error,
        })
    }
}
