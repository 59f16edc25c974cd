//! Persistent host settings.

pub mod paths;

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

const SETTINGS_SCHEMA_VERSION: u32 = 1;

const MIN_READ_SLICE_MS: u64 = 5;
const MIN_RESPONSE_TIMEOUT_MS: u64 = 50;
const MIN_HOTPLUG_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub version: u32,
    /// How long one HID read blocks before rechecking for cancellation.
    pub read_slice_ms: u64,
    /// Upper bound on a one-shot request/response round trip.
    pub response_timeout_ms: u64,
    /// How often the watcher rescans for the keyboard.
    pub hotplug_interval_ms: u64,
    /// Disarm the hardware layer key whenever the keyboard connects.
    pub disable_macro_key_on_connect: bool,
    /// Re-arm the hardware layer key when the watcher exits.
    pub restore_macro_key_on_exit: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            read_slice_ms: 50,
            response_timeout_ms: 1000,
            hotplug_interval_ms: 1000,
            disable_macro_key_on_connect: true,
            restore_macro_key_on_exit: true,
        }
    }
}

impl Settings {
    pub fn read_slice(&self) -> Duration {
        Duration::from_millis(self.read_slice_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn hotplug_interval(&self) -> Duration {
        Duration::from_millis(self.hotplug_interval_ms)
    }

    fn clamp(&mut self) {
        self.read_slice_ms = self.read_slice_ms.max(MIN_READ_SLICE_MS);
        self.response_timeout_ms = self.response_timeout_ms.max(MIN_RESPONSE_TIMEOUT_MS);
        self.hotplug_interval_ms = self.hotplug_interval_ms.max(MIN_HOTPLUG_INTERVAL_MS);
    }
}

/// Loads settings from the default location, falling back to defaults when
/// no file exists yet.
pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(&paths::settings_path()?)
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<Settings> {
    if !path.exists() {
        debug!(path = %path.display(), "no settings file; using defaults");
        return Ok(Settings::default());
    }

    let raw = fs::read_to_string(path)?;
    let mut s: Settings = serde_json::from_str(&raw)?;

    if s.version == 0 {
        // Files written before versioning.
        s.version = SETTINGS_SCHEMA_VERSION;
    }

    if s.version != SETTINGS_SCHEMA_VERSION {
        anyhow::bail!("unsupported settings version: {}", s.version);
    }

    s.clamp();
    Ok(s)
}

pub fn save_settings(settings: &Settings) -> anyhow::Result<()> {
    save_settings_to(settings, &paths::settings_path()?)
}

pub fn save_settings_to(settings: &Settings, path: &Path) -> anyhow::Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        anyhow::bail!(
            "refusing to save unsupported settings version: {}",
            settings.version
        );
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(settings)?;

    {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(&json)?;
        f.write_all(b"\n")?;
        f.sync_all()?;
    }

    // Windows will not rename over an existing file.
    if cfg!(windows) && path.exists() {
        fs::remove_file(path)?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings_from(&dir.path().join("settings.json")).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = Settings {
            disable_macro_key_on_connect: false,
            response_timeout_ms: 250,
            ..Settings::default()
        };
        save_settings_to(&settings, &path).unwrap();
        assert_eq!(load_settings_from(&path).unwrap(), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_partial_file_fills_defaults_and_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "read_slice_ms": 0, "restore_macro_key_on_exit": false }"#).unwrap();

        let s = load_settings_from(&path).unwrap();
        assert_eq!(s.version, SETTINGS_SCHEMA_VERSION);
        assert_eq!(s.read_slice_ms, MIN_READ_SLICE_MS);
        assert!(!s.restore_macro_key_on_exit);
        assert_eq!(s.hotplug_interval_ms, Settings::default().hotplug_interval_ms);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "version": 7 }"#).unwrap();
        let err = load_settings_from(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported settings version"));
    }
}
