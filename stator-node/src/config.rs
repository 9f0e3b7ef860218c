//! statord configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stator_manager::HolderConfig;
use stator_runtime::RuntimeConfig;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub runtime: RuntimeConfig,
    pub holder: HolderConfig,
}

impl NodeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        serde_yaml::from_str(&contents).with_context(|| format!("Failed to parse config {:?}", path))
    }

    /// The file at `path`, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stator_runtime::DefaultPathPolicy;
    use std::io::Write;

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "runtime:\n  node_name: edge-1\n  queue_count: 2\n  default_path_policy: ignore\nholder:\n  timeout_ms: 500\n"
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.runtime.node_name, "edge-1");
        assert_eq!(config.runtime.queue_count, 2);
        assert_eq!(config.runtime.default_path_policy, DefaultPathPolicy::Ignore);
        assert_eq!(config.runtime.mailbox_capacity, 20);
        assert_eq!(config.holder.timeout_ms, 500);
        assert_eq!(config.holder.respond_callback, "core-manager");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(NodeConfig::from_file(dir.path().join("absent.yml")).is_err());
        assert_eq!(NodeConfig::load(None).unwrap(), NodeConfig::default());
    }
}
