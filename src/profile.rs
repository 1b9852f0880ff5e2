use crate::ssh_config::{self, ConfigParseError, ResolveContext};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_jump: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_command: Option<String>,
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_file", &self.identity_file)
            .field("proxy_jump", &self.proxy_jump)
            .field("proxy_command", &self.proxy_command)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("profile '{0}' has an empty host")]
    MissingHost(String),
    #[error("profile '{0}' has an empty username")]
    MissingUsername(String),
    #[error("profile '{0}' has port 0")]
    InvalidPort(String),
}

impl ConnectionProfile {
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            password: None,
            identity_file: None,
            proxy_jump: None,
            proxy_command: None,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            self.host.trim()
        } else {
            self.name.trim()
        }
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.host.trim().is_empty() {
            return Err(ProfileError::MissingHost(self.display_name().to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(ProfileError::MissingUsername(
                self.display_name().to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ProfileError::InvalidPort(self.display_name().to_string()));
        }
        Ok(())
    }

    pub fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();
        self.host = self.host.trim().to_string();
        self.username = self.username.trim().to_string();
        if self.name.is_empty() {
            self.name = self.host.clone();
        }
        self.password = self.password.filter(|v| !v.is_empty());
        self.identity_file = non_blank(self.identity_file);
        self.proxy_jump = non_blank(self.proxy_jump);
        self.proxy_command = non_blank(self.proxy_command);
        self
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

const fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to read import file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse JSON profile list: {0}")]
    Json(#[from] serde_json::Error),
    #[error("import produced no profiles")]
    Empty,
}

#[derive(Debug, Clone, Default)]
pub struct Imported {
    pub profiles: Vec<ConnectionProfile>,
    pub diagnostics: Vec<ConfigParseError>,
}

/// Imports profiles from either an SSH config file body or a JSON array of
/// profiles. JSON is detected by a leading `[`.
pub fn import_profiles(text: &str, ctx: &ResolveContext) -> Result<Imported, ImportError> {
    let imported = if text.trim_start().starts_with('[') {
        let profiles: Vec<ConnectionProfile> = serde_json::from_str(text)?;
        Imported {
            profiles: profiles
                .into_iter()
                .map(ConnectionProfile::normalized)
                .collect(),
            diagnostics: Vec::new(),
        }
    } else {
        let (profiles, diagnostics) = ssh_config::resolve_text(text, ctx);
        Imported {
            profiles,
            diagnostics,
        }
    };

    if imported.profiles.is_empty() {
        return Err(ImportError::Empty);
    }
    Ok(imported)
}

pub fn import_file(path: impl AsRef<Path>, ctx: &ResolveContext) -> Result<Imported, ImportError> {
    let path_ref = path.as_ref();
    let text = fs::read_to_string(path_ref).map_err(|source| ImportError::Read {
        path: path_ref.display().to_string(),
        source,
    })?;
    import_profiles(&text, ctx)
}
