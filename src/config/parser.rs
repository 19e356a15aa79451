//! Loading `provision-pilot.yaml`.
//!
//! A configuration file is read together with the `.env` file next to it and
//! `PILOT_*` overrides from the environment. Relative local state paths are
//! anchored at the file's directory so runs from any working directory agree.

use crate::error::{ConfigError, PilotError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::PilotConfig;

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["provision-pilot.yaml", "provision-pilot.yml"];

/// Reads operator configuration.
#[derive(Debug, Default)]
pub struct ConfigParser;

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Loads `.env`, then `path`, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `FileNotFound` for a missing file and `ParseError` for an
    /// unreadable file, invalid YAML or a malformed `.env`.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<PilotConfig> {
        let path = path.as_ref();
        let dir = config_dir(path);
        load_dotenv(&dir.join(".env"))?;

        info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound {
                path: path.to_path_buf(),
            },
            _ => ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            },
        })?;

        let mut config = self.parse_yaml(&content, Some(path))?;
        if let Some(state_path) = &config.state.path {
            if Path::new(state_path).is_relative() {
                config.state.path = Some(dir.join(state_path).display().to_string());
            }
        }
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` with the source file or the YAML position.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<PilotConfig> {
        let config: PilotConfig = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: format!("YAML parse error: {e}"),
            location: source
                .map(|p| p.display().to_string())
                .or_else(|| e.location().map(|l| format!("line {}, column {}", l.line(), l.column()))),
        })?;

        debug!("Parsed configuration with {} project(s)", config.projects.len());
        Ok(config)
    }

    /// Applies `PILOT_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides(config: &mut PilotConfig, lookup: impl Fn(&str) -> Option<String>) {
        let overrides: [(&str, &mut Option<String>); 3] = [
            ("PILOT_STATE_BUCKET", &mut config.state.bucket),
            ("PILOT_STATE_PREFIX", &mut config.state.prefix),
            ("PILOT_STATE_PATH", &mut config.state.path),
        ];
        for (name, slot) in overrides {
            if let Some(value) = lookup(name) {
                debug!("{name} overrides the configuration file");
                *slot = Some(value);
            }
        }

        if let Some(url) = lookup("PILOT_PROVIDER_URL") {
            debug!("PILOT_PROVIDER_URL overrides the configuration file");
            config.provider.base_url = url;
        }
    }

    /// Reads the provisioning gateway token from the named variable.
    ///
    /// # Errors
    ///
    /// Returns `MissingEnvVar` if the variable is not set.
    pub fn api_token(name: &str) -> Result<String> {
        std::env::var(name).map_err(|_| {
            PilotError::Config(ConfigError::MissingEnvVar {
                name: name.to_string(),
            })
        })
    }
}

/// Directory holding a configuration file, `.` for a bare file name.
#[must_use]
pub fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn load_dotenv(env_path: &Path) -> Result<()> {
    if !env_path.exists() {
        debug!("No .env at {}", env_path.display());
        return Ok(());
    }

    info!("Loading environment from: {}", env_path.display());
    dotenvy::from_path(env_path).map_err(|e| ConfigError::ParseError {
        message: format!("Failed to load .env file: {e}"),
        location: Some(env_path.display().to_string()),
    })?;
    Ok(())
}

/// Finds the configuration file in `start_dir` or one of its ancestors.
///
/// # Errors
///
/// Returns `FileNotFound` naming the preferred file name under `start_dir`.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    for dir in start.ancestors() {
        if let Some(found) = DEFAULT_CONFIG_FILES.iter().map(|name| dir.join(name)).find(|p| p.exists()) {
            info!("Found configuration file: {}", found.display());
            return Ok(found);
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}
