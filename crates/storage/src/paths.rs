use std::path::PathBuf;

use directories::ProjectDirs;

pub fn project_dirs() -> anyhow::Result<ProjectDirs> {
    ProjectDirs::from("io", "github", "sinc-keyboard-control")
        .ok_or_else(|| anyhow::anyhow!("unable to determine platform data directories"))
}

/// Per-user directory holding the keyboard host's settings file.
pub fn data_dir() -> anyhow::Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("settings.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_live_in_data_dir() {
        // No home directory (some CI sandboxes) means no platform dirs at all.
        let Ok(dir) = data_dir() else {
            return;
        };
        let path = settings_path().unwrap();
        assert_eq!(path.parent(), Some(dir.as_path()));
        assert_eq!(path.file_name().unwrap(), "settings.json");
    }
}
