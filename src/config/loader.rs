//! Configuration discovery and validation.
//!
//! Every `*.yml` file in the configuration directory is parsed as a
//! [`RootConfiguration`] fragment. Fragments merge in filename order: the
//! last `global` section wins, application lists concatenate. Applications
//! failing validation are skipped with an error log rather than aborting
//! the whole load.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info};

use super::{ApplicationConfiguration, GlobalConfiguration, RootConfiguration};

/// The merged result of configuration discovery. Each application keeps the
/// path of the file that declared it, so the hot-reload watcher knows what
/// to re-read.
#[derive(Debug, Default)]
pub struct LoadedConfiguration {
    pub global: GlobalConfiguration,
    pub applications: Vec<(ApplicationConfiguration, PathBuf)>,
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration directory could not be read.
    #[error("could not read configuration directory {dir}: {source}")]
    DirUnreadable {
        dir: PathBuf,
        source: std::io::Error,
    },

    /// A configuration file could not be read.
    #[error("could not read configuration file {file}: {source}")]
    FileUnreadable {
        file: PathBuf,
        source: std::io::Error,
    },

    /// A configuration file is not valid YAML.
    #[error("error in configuration file {file}: {source}")]
    Parse {
        file: PathBuf,
        source: serde_yaml::Error,
    },

    /// An application section failed validation.
    #[error("application {name}: {reason}")]
    InvalidApplication { name: String, reason: String },
}

/// Discovers and merges every `*.yml` file in `dir`.
pub fn load_configurations(dir: &Path) -> Result<LoadedConfiguration, ConfigError> {
    let mut files = yaml_files(dir)?;
    files.sort();

    let mut merged = LoadedConfiguration::default();
    for file in files {
        info!(file = %file.display(), "Found configuration file");
        match parse_configuration_file(&file) {
            Ok(root) => {
                if root.global != Default::default() {
                    merged.global = root.global;
                }
                for application in root.applications {
                    match validate_application(&application) {
                        Ok(()) => merged.applications.push((application, file.clone())),
                        Err(e) => error!(error = %e, "Skipping invalid application"),
                    }
                }
            }
            Err(e) => error!(error = %e, "Skipping unparsable configuration file"),
        }
    }

    if merged
        .applications
        .iter()
        .filter(|(application, _)| application.is_default)
        .count()
        > 1
    {
        return Err(ConfigError::InvalidApplication {
            name: "<root>".to_string(),
            reason: "more than one application is marked is_default".to_string(),
        });
    }

    Ok(merged)
}

/// Parses one configuration file.
pub fn parse_configuration_file(file: &Path) -> Result<RootConfiguration, ConfigError> {
    let content = std::fs::read_to_string(file).map_err(|source| ConfigError::FileUnreadable {
        file: file.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        file: file.to_path_buf(),
        source,
    })
}

fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::DirUnreadable {
        dir: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "yml") {
            files.push(path);
        }
    }
    Ok(files)
}

fn validate_application(application: &ApplicationConfiguration) -> Result<(), ConfigError> {
    if application.name.is_empty() {
        return Err(ConfigError::InvalidApplication {
            name: "<unnamed>".to_string(),
            reason: "name is empty".to_string(),
        });
    }
    if application.remote.is_empty() {
        return Err(ConfigError::InvalidApplication {
            name: application.name.clone(),
            reason: "remote is empty".to_string(),
        });
    }
    if !application.target.contains("{{port}}") {
        return Err(ConfigError::InvalidApplication {
            name: application.name.clone(),
            reason: "target must contain {{port}}".to_string(),
        });
    }
    Ok(())
}
