use crate::collectors::session::{default_control_dir, SshSettings};
use crate::profile::{self, ConnectionProfile, ImportError};
use crate::ssh_config::{ConfigParseError, ResolveContext};
use crate::state::DEFAULT_HISTORY_CAPACITY;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default)]
    pub ssh: SshOptions,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub nodes: Vec<ConnectionProfile>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshOptions {
    #[serde(default = "default_ssh_binary")]
    pub binary: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_control_persist_secs")]
    pub control_persist_secs: u64,
    #[serde(default)]
    pub control_dir: Option<String>,
    #[serde(default = "default_askpass_env")]
    pub askpass_env: String,
    #[serde(default = "default_accept_unknown_hosts")]
    pub accept_unknown_hosts: bool,
}

/// Extra profile sources read at startup, merged after `nodes`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ImportConfig {
    #[serde(default)]
    pub ssh_config: Option<String>,
    #[serde(default)]
    pub profiles_json: Option<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            binary: default_ssh_binary(),
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            control_persist_secs: default_control_persist_secs(),
            control_dir: None,
            askpass_env: default_askpass_env(),
            accept_unknown_hosts: default_accept_unknown_hosts(),
        }
    }
}

impl SshOptions {
    pub fn settings(&self, ctx: &ResolveContext) -> SshSettings {
        SshSettings {
            binary: self.binary.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            control_persist: Duration::from_secs(self.control_persist_secs),
            control_dir: self
                .control_dir
                .as_deref()
                .map(|dir| PathBuf::from(ctx.expand_home(dir)))
                .unwrap_or_else(default_control_dir),
            askpass_env: self.askpass_env.clone(),
            accept_unknown_hosts: self.accept_unknown_hosts,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("failed to import profiles from {path}: {source}")]
    Import { path: String, source: ImportError },
}

/// Profiles gathered from the config file and its import sources.
#[derive(Debug, Default)]
pub struct LoadedProfiles {
    pub profiles: Vec<ConnectionProfile>,
    pub diagnostics: Vec<ConfigParseError>,
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs must be >= 1".to_string(),
            ));
        }
        if self.history_capacity < 1 {
            return Err(ConfigError::Validation(
                "history_capacity must be >= 1".to_string(),
            ));
        }

        validate_ssh(&self.ssh)?;
        validate_nodes(&self.nodes)?;
        Ok(())
    }

    /// Inline nodes first, then the SSH config import, then the JSON import.
    /// Later sources never replace a profile id that is already present.
    pub fn load_profiles(&self, ctx: &ResolveContext) -> Result<LoadedProfiles, ConfigError> {
        let mut loaded = LoadedProfiles {
            profiles: self
                .nodes
                .iter()
                .cloned()
                .map(ConnectionProfile::normalized)
                .collect(),
            diagnostics: Vec::new(),
        };

        let sources = [&self.import.ssh_config, &self.import.profiles_json];
        for path in sources.into_iter().flatten() {
            let path = ctx.expand_home(path);
            let imported =
                profile::import_file(&path, ctx).map_err(|source| ConfigError::Import {
                    path: path.clone(),
                    source,
                })?;
            let mut seen: HashSet<_> = loaded.profiles.iter().map(|p| p.id).collect();
            loaded.profiles.extend(
                imported
                    .profiles
                    .into_iter()
                    .filter(|p| seen.insert(p.id)),
            );
            loaded.diagnostics.extend(imported.diagnostics);
        }
        Ok(loaded)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_ssh(ssh: &SshOptions) -> Result<(), ConfigError> {
    if ssh.binary.trim().is_empty() {
        return Err(ConfigError::Validation(
            "ssh.binary must not be empty".to_string(),
        ));
    }
    if ssh.connect_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "ssh.connect_timeout_secs must be >= 1".to_string(),
        ));
    }
    if ssh.command_timeout_secs < ssh.connect_timeout_secs {
        return Err(ConfigError::Validation(
            "ssh.command_timeout_secs must be >= ssh.connect_timeout_secs".to_string(),
        ));
    }
    if ssh.control_persist_secs < 1 {
        return Err(ConfigError::Validation(
            "ssh.control_persist_secs must be >= 1".to_string(),
        ));
    }
    let env = ssh.askpass_env.as_str();
    let valid_env = env
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && env.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_env {
        return Err(ConfigError::Validation(format!(
            "ssh.askpass_env '{env}' is not a valid environment variable name"
        )));
    }
    Ok(())
}

fn validate_nodes(nodes: &[ConnectionProfile]) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    for node in nodes {
        node.clone()
            .normalized()
            .validate()
            .map_err(|err| ConfigError::Validation(format!("nodes: {err}")))?;
        if !ids.insert(node.id) {
            return Err(ConfigError::Validation(format!(
                "nodes: id {} is used more than once",
                node.id
            )));
        }
    }
    Ok(())
}

const fn default_interval_secs() -> u64 {
    3
}

const fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

const fn default_command_timeout_secs() -> u64 {
    15
}

const fn default_control_persist_secs() -> u64 {
    600
}

fn default_askpass_env() -> String {
    "FLEETMON_SSH_PASSWORD".to_string()
}

const fn default_accept_unknown_hosts() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> Config {
        Config {
            listen: "127.0.0.1:9108".to_string(),
            interval_secs: 3,
            history_capacity: 60,
            ssh: SshOptions::default(),
            import: ImportConfig::default(),
            nodes: vec![],
        }
    }

    fn ctx(home: &Path) -> ResolveContext {
        ResolveContext {
            local_user: "operator".to_string(),
            home_dir: Some(home.to_path_buf()),
        }
    }

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example parses");
        cfg.validate().expect("example is valid");
        assert_eq!(cfg.interval_secs, 3);
        assert_eq!(cfg.history_capacity, 60);
        assert!(!cfg.nodes.is_empty());
    }

    #[test]
    fn minimal_yaml_gets_defaults() {
        let cfg: Config = serde_yaml::from_str("listen: 0.0.0.0:9108\n").expect("parse");
        assert_eq!(cfg.interval_secs, 3);
        assert_eq!(cfg.ssh.command_timeout_secs, 15);
        assert_eq!(cfg.ssh.askpass_env, "FLEETMON_SSH_PASSWORD");
        assert!(cfg.ssh.accept_unknown_hosts);
        assert!(cfg.nodes.is_empty());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = valid_config();
        cfg.interval_secs = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = valid_config();
        cfg.listen = "nope".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.ssh.askpass_env = "BAD-NAME".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.ssh.command_timeout_secs = 2;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        let node = ConnectionProfile::new("n", "n.lan", "ml");
        cfg.nodes = vec![node.clone(), node];
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.nodes = vec![ConnectionProfile::new("n", "n.lan", " ")];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_profiles_merges_import_sources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ssh_path = dir.path().join("ssh_config");
        let mut file = fs::File::create(&ssh_path).expect("create");
        writeln!(file, "Host gpu-a\n  User ml\n  Port").expect("write");

        let json_path = dir.path().join("nodes.json");
        fs::write(
            &json_path,
            r#"[{"name": "gpu-b", "host": "10.0.0.2", "username": "ml"}]"#,
        )
        .expect("write json");

        let mut cfg = valid_config();
        cfg.nodes = vec![ConnectionProfile::new("inline", "10.0.0.1", "root")];
        cfg.import.ssh_config = Some("~/ssh_config".to_string());
        cfg.import.profiles_json = Some(json_path.display().to_string());

        let loaded = cfg.load_profiles(&ctx(dir.path())).expect("load");
        let names: Vec<&str> = loaded.profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["inline", "gpu-a", "gpu-b"]);
        assert_eq!(loaded.diagnostics.len(), 1);
    }

    #[test]
    fn missing_import_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = valid_config();
        cfg.import.ssh_config = Some(dir.path().join("absent").display().to_string());
        assert!(matches!(
            cfg.load_profiles(&ctx(dir.path())),
            Err(ConfigError::Import { .. })
        ));
    }

    #[test]
    fn ssh_settings_expand_control_dir() {
        let mut options = SshOptions::default();
        options.control_dir = Some("~/.fleetmon/sockets".to_string());
        let settings = options.settings(&ctx(Path::new("/home/operator")));
        assert_eq!(
            settings.control_dir,
            PathBuf::from("/home/operator/.fleetmon/sockets")
        );
        assert_eq!(settings.command_timeout, Duration::from_secs(15));
    }
}
