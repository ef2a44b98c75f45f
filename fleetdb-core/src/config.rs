use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::collaborators::{RoleTopology, StaticDirectory};
use crate::error::{DataError, DataResult};
use crate::pool::{
    PoolSettings, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};
use crate::relay::github::DispatchTarget;
use crate::relay::DEFAULT_API_BASE;
use crate::token::AppIdentity;
use crate::types::{InstanceId, Role};

/// Fleet configuration
///
/// ```toml
/// [pool]
/// max_connections = 3
///
/// [instances]
/// ins1 = "${INS1_DATABASE_URL}"
///
/// [roles]
/// Directivo = ["ins1", "ins2"]
///
/// [relay]
/// app_id = "123456"
/// installation_id = "7890"
/// private_key_path = "~/.fleetdb/relay.pem"
/// owner = "my-org"
/// repo = "fleet-relay"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub pool: PoolConfig,

    /// Instance id → connection URL
    #[serde(default)]
    pub instances: BTreeMap<String, String>,

    /// Role → instances holding that role's data
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_require_tls")]
    pub require_tls: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            idle_timeout_ms: default_idle_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            require_tls: default_require_tls(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub app_id: String,

    #[serde(default)]
    pub installation_id: String,

    /// Inline PEM; `\n` escapes are accepted
    #[serde(default, skip_serializing)]
    pub private_key: Option<String>,

    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub repo: String,

    #[serde(default = "default_event_type")]
    pub event_type: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            installation_id: String::new(),
            private_key: None,
            private_key_path: None,
            owner: String::new(),
            repo: String::new(),
            event_type: default_event_type(),
            api_base: default_api_base(),
        }
    }
}

// Default value functions for serde
fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_millis() as u64
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_require_tls() -> bool {
    true
}

fn default_event_type() -> String {
    "replicate-sql".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

impl FleetConfig {
    /// Default search path: ./fleetdb.toml, then ~/.fleetdb/config.toml
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("fleetdb.toml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".fleetdb").join("config.toml"));
        }
        paths
    }

    /// Loads configuration and applies environment overrides.
    ///
    /// An explicit path must exist. Without one the first file found on the
    /// search path is used, or built-in defaults if there is none.
    pub fn load(explicit: Option<&Path>) -> DataResult<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::search_paths().into_iter().find(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    debug!("no fleetdb config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.expand_variables(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> DataResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            DataError::configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        let config = Self::from_toml_str(&content).map_err(|err| match err {
            DataError::Configuration { reason } => {
                DataError::configuration(format!("{}: {reason}", path.display()))
            }
            other => other,
        })?;
        info!("loaded fleet config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> DataResult<Self> {
        toml::from_str(content)
            .map_err(|err| DataError::configuration(format!("invalid TOML: {err}")))
    }

    /// Overrides pool and relay identity settings from `FLEETDB_*` variables
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let max_connections =
            parsed("FLEETDB_PG_MAX_CONNECTIONS").and_then(|v| u32::try_from(v).ok());
        if let Some(max) = max_connections {
            self.pool.max_connections = max;
        }
        if let Some(ms) = parsed("FLEETDB_PG_IDLE_TIMEOUT_MS") {
            self.pool.idle_timeout_ms = ms;
        }
        if let Some(ms) = parsed("FLEETDB_PG_CONNECT_TIMEOUT_MS") {
            self.pool.connect_timeout_ms = ms;
        }
        if let Some(app_id) = lookup("FLEETDB_RELAY_APP_ID") {
            self.relay.app_id = app_id;
        }
        if let Some(installation_id) = lookup("FLEETDB_RELAY_INSTALLATION_ID") {
            self.relay.installation_id = installation_id;
        }
        if let Some(key) = lookup("FLEETDB_RELAY_PRIVATE_KEY") {
            self.relay.private_key = Some(key);
        }
    }

    /// Expands `${VAR}` references in instance URLs
    pub fn expand_variables(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for url in self.instances.values_mut() {
            *url = expand_string(url, &lookup);
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.pool.max_connections.max(1),
            idle_timeout: Duration::from_millis(self.pool.idle_timeout_ms),
            connect_timeout: Duration::from_millis(self.pool.connect_timeout_ms),
            require_tls: self.pool.require_tls,
        }
    }

    pub fn directory(&self) -> StaticDirectory {
        let urls: HashMap<InstanceId, String> = self
            .instances
            .iter()
            .map(|(id, url)| (InstanceId::from(id.as_str()), url.clone()))
            .collect();
        StaticDirectory::new(urls)
    }

    pub fn topology(&self) -> RoleTopology {
        let by_role: HashMap<Role, BTreeSet<InstanceId>> = self
            .roles
            .iter()
            .map(|(role, instances)| {
                (
                    Role::from(role.as_str()),
                    instances.iter().map(|i| InstanceId::from(i.as_str())).collect(),
                )
            })
            .collect();
        RoleTopology::new(by_role)
    }

    /// Relay identity; fields may be empty, which the token cache rejects at use
    pub fn app_identity(&self) -> DataResult<AppIdentity> {
        let private_key = match (&self.relay.private_key, &self.relay.private_key_path) {
            (Some(inline), _) => inline.replace("\\n", "\n"),
            (None, Some(path)) => {
                let path = expand_home(path);
                std::fs::read_to_string(&path).map_err(|err| {
                    DataError::configuration(format!(
                        "failed to read relay signing key {}: {err}",
                        path.display()
                    ))
                })?
            }
            (None, None) => String::new(),
        };

        Ok(AppIdentity {
            app_id: self.relay.app_id.clone(),
            installation_id: self.relay.installation_id.clone(),
            private_key,
        })
    }

    pub fn dispatch_target(&self) -> DispatchTarget {
        DispatchTarget {
            owner: self.relay.owner.clone(),
            repo: self.relay.repo.clone(),
            event_type: self.relay.event_type.clone(),
        }
    }

    /// Problems that would make calls fail at runtime
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.instances.is_empty() {
            problems.push("no instances configured".to_string());
        }
        for (id, url) in &self.instances {
            if url.trim().is_empty() {
                problems.push(format!("instance {id} has no connection URL"));
            }
        }
        for (role, instances) in &self.roles {
            for instance in instances {
                if !self.instances.contains_key(instance) {
                    problems.push(format!("role {role} references unknown instance {instance}"));
                }
            }
        }
        if !self.roles.is_empty() {
            match self.app_identity() {
                Ok(identity) => {
                    if let Err(err) = identity.validate() {
                        problems.push(err.to_string());
                    }
                }
                Err(err) => problems.push(err.to_string()),
            }
            if self.relay.owner.is_empty() || self.relay.repo.is_empty() {
                problems.push("relay owner/repo not set".to_string());
            }
        }
        problems
    }
}

/// Replaces `${VAR}` with its value; unknown variables expand to empty
fn expand_string(value: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&lookup(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
