use std::path::{Path, PathBuf};

use crate::config::types::CodeletConfig;
use crate::error::{CodeletError, Result};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "codelet", "codelet") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        dirs_fallback().join(".codelet").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values.
///
/// A missing default file means built-in defaults; a missing file that was
/// asked for explicitly is an error.
pub fn load_config(config_path: Option<&Path>) -> Result<CodeletConfig> {
    let path = match config_path {
        Some(path) if !path.exists() => {
            return Err(CodeletError::ConfigNotFound {
                path: path.display().to_string(),
            })
        }
        Some(path) => path.to_path_buf(),
        None => get_config_path(),
    };

    if !path.exists() {
        return Ok(CodeletConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: CodeletConfig =
        toml::from_str(&content).map_err(|e| CodeletError::TomlParse(e.to_string()))?;

    Ok(config)
}

/// Write the default configuration to `path`, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = to_toml(&CodeletConfig::default())?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

pub fn to_toml(config: &CodeletConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| CodeletError::Config(e.to_string()))
}
