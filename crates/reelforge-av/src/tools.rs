//! External tool detection.
//!
//! The [`ToolRegistry`] discovers and caches the locations of ffmpeg and
//! ffprobe and hands their paths to the rest of the crate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use reelforge_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Known tool names that the registry manages.
const KNOWN_TOOLS: &[&str] = &["ffmpeg", "ffprobe"];

/// Path overrides for external tools (the `[tools]` config section).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,
}

/// Availability information for a tool, returned by [`ToolRegistry::check_all`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub available: bool,
    /// First line of `-version` output, if available.
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

/// Registry holding discovered tool paths.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, PathBuf>,
}

impl ToolRegistry {
    /// Discover tools from config overrides, falling back to `PATH`.
    ///
    /// An override that does not exist is ignored. Tools that are not found
    /// are omitted from the registry.
    pub fn discover(config: &ToolsConfig) -> Self {
        let mut tools = HashMap::new();

        for &name in KNOWN_TOOLS {
            let custom_path = match name {
                "ffmpeg" => config.ffmpeg_path.as_deref(),
                "ffprobe" => config.ffprobe_path.as_deref(),
                _ => None,
            };

            let resolved = match custom_path {
                Some(p) if p.exists() => Some(p.to_path_buf()),
                _ => which::which(name).ok(),
            };

            if let Some(path) = resolved {
                tools.insert(name.to_string(), path);
            }
        }

        Self { tools }
    }

    /// Path of the given tool, or a configuration error if it was not found.
    pub fn require(&self, name: &str) -> Result<&Path> {
        self.tools
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| {
                Error::configuration(format!("{name} not found; is it installed and in PATH?"))
            })
    }

    pub fn ffmpeg(&self) -> Result<&Path> {
        self.require("ffmpeg")
    }

    /// Check all known tools and return availability information.
    pub fn check_all(&self) -> Vec<ToolInfo> {
        KNOWN_TOOLS
            .iter()
            .map(|&name| match self.tools.get(name) {
                Some(path) => ToolInfo {
                    name: name.to_string(),
                    available: true,
                    version: detect_version(path),
                    path: Some(path.clone()),
                },
                None => ToolInfo {
                    name: name.to_string(),
                    available: false,
                    version: None,
                    path: None,
                },
            })
            .collect()
    }
}

/// Run `<tool> -version` and return the first line of stdout.
fn detect_version(path: &Path) -> Option<String> {
    let output = std::process::Command::new(path)
        .arg("-version")
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_missing_tool_returns_error() {
        let registry = ToolRegistry::discover(&ToolsConfig::default());
        let err = registry.require("nonexistent_tool_xyz").unwrap_err();
        assert!(err.to_string().contains("nonexistent_tool_xyz"));
    }

    #[test]
    fn check_all_returns_known_tools() {
        let registry = ToolRegistry::discover(&ToolsConfig::default());
        let names: Vec<String> = registry.check_all().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["ffmpeg", "ffprobe"]);
    }

    #[test]
    fn existing_override_is_used() {
        let fake = tempfile::NamedTempFile::new().unwrap();
        let config = ToolsConfig {
            ffmpeg_path: Some(fake.path().to_path_buf()),
            ffprobe_path: None,
        };
        let registry = ToolRegistry::discover(&config);
        assert_eq!(registry.ffmpeg().unwrap(), fake.path());
    }

    #[test]
    fn tools_config_deserializes_from_json() {
        let config: ToolsConfig =
            serde_json::from_str(r#"{"ffmpeg_path": "/opt/ffmpeg/bin/ffmpeg"}"#).unwrap();
        assert_eq!(
            config.ffmpeg_path.as_deref(),
            Some(Path::new("/opt/ffmpeg/bin/ffmpeg"))
        );
        assert!(config.ffprobe_path.is_none());
    }
}
