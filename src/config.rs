//! CLI configuration
//!
//! The `annex` binary reads an optional `annex.toml` next to the working
//! directory for a default storage URL, so repeated inspection commands
//! don't have to repeat `--url`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnnexConfig {
    /// Default storage URL (`sqlite:<path>[;<package_id>]`)
    pub url: Option<String>,
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("annex.toml")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<AnnexConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: AnnexConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("annex.toml");
        assert!(load_config(Some(&path)).unwrap().is_none());
    }

    #[test]
    fn test_load_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("annex.toml");
        std::fs::write(&path, "url = \"sqlite:project.db;main\"\n").unwrap();
        let config = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(config.url.as_deref(), Some("sqlite:project.db;main"));
    }
}
