//! Bot configuration, loaded from a YAML file.
//!
//! The file names the repositories to watch and the cluster and GitHub
//! coordinates the bot operates under. Everything that changes per
//! deployment lives here; tuning knobs that never change (poll cadence,
//! retry caps) stay as constants next to the code they govern.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::types::RepoName;

/// Errors raised while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config file {path} lists no repositories")]
    NoRepositories { path: String },
}

/// Deployment-specific settings for one bot instance.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Repositories to watch, by name within [`Config::github_org`].
    pub repositories: Vec<RepoName>,
    /// Kubernetes namespace holding the slot deployments and build jobs.
    pub namespace: String,
    /// GitHub organization owning the watched repositories.
    pub github_org: String,
    /// Domain under which slot builds are served, e.g. `preview.example.org`.
    pub preview_domain: String,
    /// Login the bot's comments are posted under.
    #[serde(default = "default_bot_login")]
    pub bot_login: String,
    /// Enables verbose per-cycle diagnostics.
    #[serde(default)]
    pub debug: bool,
}

fn default_bot_login() -> String {
    "preview-slots[bot]".to_string()
}

impl Config {
    /// Loads and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: display.clone(),
                source,
            })?;
        if config.repositories.is_empty() {
            return Err(ConfigError::NoRepositories { path: display });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_full_config() {
        let file = write_config(
            "repositories:\n\
             \x20 - website\n\
             \x20 - website-theme\n\
             namespace: previews\n\
             github_org: example-org\n\
             preview_domain: preview.example.org\n\
             bot_login: my-bot[bot]\n\
             debug: true\n",
        );

        let config = Config::load(file.path()).unwrap();
        assert_eq!(
            config.repositories,
            vec![RepoName::from("website"), RepoName::from("website-theme")]
        );
        assert_eq!(config.namespace, "previews");
        assert_eq!(config.github_org, "example-org");
        assert_eq!(config.preview_domain, "preview.example.org");
        assert_eq!(config.bot_login, "my-bot[bot]");
        assert!(config.debug);
    }

    #[test]
    fn bot_login_and_debug_default() {
        let file = write_config(
            "repositories: [website]\n\
             namespace: previews\n\
             github_org: example-org\n\
             preview_domain: preview.example.org\n",
        );

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.bot_login, "preview-slots[bot]");
        assert!(!config.debug);
    }

    #[test]
    fn empty_repository_list_is_rejected() {
        let file = write_config(
            "repositories: []\n\
             namespace: previews\n\
             github_org: example-org\n\
             preview_domain: preview.example.org\n",
        );

        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::NoRepositories { .. })
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load(Path::new("/nonexistent/config.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let file = write_config("repositories: {not a list\n");
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
