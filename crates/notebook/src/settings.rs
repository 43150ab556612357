//! Application settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/runt-notebook/settings.json
//! - Linux: ~/.config/runt-notebook/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\runt-notebook\settings.json

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use log::warn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_kernel() -> String {
    "python3".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_execution_timeout_secs() -> u64 {
    600
}

/// Application settings. Every field has a default, so partial files load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AppSettings {
    /// Kernelspec used when a notebook names none
    #[serde(default = "default_kernel")]
    pub default_kernel: String,

    /// Seconds to wait for a kernel process to come up
    #[serde(default = "default_timeout_secs")]
    pub launch_timeout_secs: u64,

    /// Seconds to wait for `kernel_info_reply` after launch
    #[serde(default = "default_timeout_secs")]
    pub kernel_info_timeout_secs: u64,

    /// Seconds a restart may take before it is reported as failed
    #[serde(default = "default_timeout_secs")]
    pub restart_timeout_secs: u64,

    /// Seconds `runt run` waits for all cells to finish
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_kernel: default_kernel(),
            launch_timeout_secs: default_timeout_secs(),
            kernel_info_timeout_secs: default_timeout_secs(),
            restart_timeout_secs: default_timeout_secs(),
            execution_timeout_secs: default_execution_timeout_secs(),
        }
    }
}

impl AppSettings {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runt-notebook")
        .join("settings.json")
}

/// Load settings from disk, returning defaults if file doesn't exist
pub fn load_settings() -> AppSettings {
    load_settings_from(&settings_path())
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    if !path.exists() {
        return AppSettings::default();
    }
    match std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|s| serde_json::from_str(&s).map_err(anyhow::Error::from))
    {
        Ok(settings) => settings,
        Err(e) => {
            warn!("[settings] Ignoring unreadable {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

/// Save settings to disk
pub fn save_settings(settings: &AppSettings) -> Result<()> {
    save_settings_to(&settings_path(), settings)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

/// JSON Schema for the settings file.
pub fn settings_schema() -> Result<String> {
    let schema = schemars::schema_for!(AppSettings);
    Ok(serde_json::to_string_pretty(&schema)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AppSettings::default();
        assert_eq!(settings.default_kernel, "python3");
        assert_eq!(settings.launch_timeout_secs, 60);
        assert_eq!(settings.kernel_info_timeout_secs, 60);
        assert_eq!(settings.restart_timeout_secs, 60);
        assert_eq!(settings.execution_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_deserialize_partial_file() {
        let json = r#"{"default_kernel": "ir", "execution_timeout_secs": 30}"#;
        let parsed: AppSettings = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.default_kernel, "ir");
        assert_eq!(parsed.execution_timeout(), Duration::from_secs(30));
        assert_eq!(parsed.launch_timeout_secs, 60);
    }

    #[test]
    fn test_deserialize_empty_object() {
        let parsed: AppSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, AppSettings::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = AppSettings {
            kernel_info_timeout_secs: 5,
            execution_timeout_secs: 1,
            ..AppSettings::default()
        };
        save_settings_to(&path, &settings).unwrap();

        assert_eq!(load_settings_from(&path), settings);
    }

    #[test]
    fn test_missing_or_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert_eq!(load_settings_from(&path), AppSettings::default());

        std::fs::write(&path, "not json").unwrap();
        assert_eq!(load_settings_from(&path), AppSettings::default());
    }

    #[test]
    fn test_schema_names_fields() {
        let schema = settings_schema().unwrap();
        assert!(schema.contains("execution_timeout_secs"));
        assert!(schema.contains("default_kernel"));
    }

    #[test]
    #[serial_test::serial]
    fn test_settings_path_is_valid() {
        let path = settings_path();
        assert!(path.ends_with("runt-notebook/settings.json"));
    }

    #[test]
    #[serial_test::serial]
    #[cfg(target_os = "linux")]
    fn test_load_settings_reads_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let previous = std::env::var_os("XDG_CONFIG_HOME");
        std::env::set_var("XDG_CONFIG_HOME", dir.path());

        let settings = AppSettings {
            default_kernel: "deno".into(),
            ..AppSettings::default()
        };
        let saved = save_settings(&settings);
        let loaded = load_settings();

        match previous {
            Some(value) => std::env::set_var("XDG_CONFIG_HOME", value),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
        saved.unwrap();
        assert!(dir.path().join("runt-notebook").join("settings.json").exists());
        assert_eq!(loaded, settings);
    }
}
