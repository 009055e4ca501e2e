//! TOML-based configuration for the mapping service.
//!
//! Secrets (the LDAP bind password) are stored as `_env` fields naming an
//! environment variable. The actual values are resolved at runtime via
//! [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::sid::Sid;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub mapping: MappingConfig,

    /// Directory server. Absent means every directory lookup is "not found".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<DirectoryConfig>,

    #[serde(default)]
    pub nameservice: NameServiceConfig,

    #[serde(default)]
    pub ephemeral: EphemeralConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Holds `rules.db` and `cache.db`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Number of mapping workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/sidmap")
}
fn default_log_level() -> String {
    "info".into()
}
fn default_workers() -> usize {
    4
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            workers: default_workers(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    /// SID prefix of this host's local accounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_sid: Option<String>,

    /// Windows domain assumed for rules and names without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_domain: Option<String>,

    #[serde(default = "default_id_ttl")]
    pub id_cache_ttl_secs: u64,

    #[serde(default = "default_name_ttl")]
    pub name_cache_ttl_secs: u64,

    /// Give SIDs the directory does not know an ephemeral id instead of
    /// failing them.
    #[serde(default = "default_true")]
    pub ephemeral_unresolved_sids: bool,
}

fn default_id_ttl() -> u64 {
    600
}
fn default_name_ttl() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            machine_sid: None,
            mapping_domain: None,
            id_cache_ttl_secs: default_id_ttl(),
            name_cache_ttl_secs: default_name_ttl(),
            ephemeral_unresolved_sids: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// `ldap://` or `ldaps://` URL of a domain controller.
    pub ldap_url: String,

    /// Search base, e.g. `dc=corp,dc=example,dc=com`.
    pub base_dn: String,

    /// Bind DN. Anonymous bind when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_dn: Option<String>,

    /// Environment variable holding the bind password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_password_env: Option<String>,

    /// Domain name reported for directory entries. Derived from each
    /// entry's DN when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_name: Option<String>,

    #[serde(default = "default_directory_timeout")]
    pub timeout_secs: u64,

    /// Resolved bind password (not serialized).
    #[serde(skip)]
    pub bind_password: Option<String>,
}

fn default_directory_timeout() -> u64 {
    10
}

impl DirectoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Name service, ephemeral ids, stores
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameServiceConfig {
    #[serde(default = "default_passwd_file")]
    pub passwd_file: PathBuf,

    #[serde(default = "default_group_file")]
    pub group_file: PathBuf,
}

fn default_passwd_file() -> PathBuf {
    PathBuf::from("/etc/passwd")
}
fn default_group_file() -> PathBuf {
    PathBuf::from("/etc/group")
}

impl Default for NameServiceConfig {
    fn default() -> Self {
        Self {
            passwd_file: default_passwd_file(),
            group_file: default_group_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralConfig {
    /// Ids requested from the id-space authority at a time.
    #[serde(default = "default_block_size")]
    pub block_size: u32,
}

fn default_block_size() -> u32 {
    crate::ephemeral::DEFAULT_BLOCK_SIZE
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Seconds of busy-waiting on a store lock between warnings.
    #[serde(default = "default_busy_warn")]
    pub busy_warn_secs: u64,
}

fn default_busy_warn() -> u64 {
    2
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_warn_secs: default_busy_warn(),
        }
    }
}

impl StoreConfig {
    pub fn busy_warn(&self) -> Duration {
        Duration::from_secs(self.busy_warn_secs)
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `*_env` fields. A missing variable is logged, not fatal: an
    /// unresolved bind password falls back to an unauthenticated bind.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(dir) = self.directory.as_mut() {
            if let Some(ref env_name) = dir.bind_password_env {
                dir.bind_password = resolve_optional_env(env_name, "directory.bind_password_env");
            }
        }
        Ok(())
    }

    /// Validate that all values are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref machine_sid) = self.mapping.machine_sid {
            // The whole string is a prefix, so it must parse as a SID
            // itself.
            Sid::parse(machine_sid).map_err(|e| ConfigError::InvalidValue {
                field: "mapping.machine_sid".into(),
                detail: e.to_string(),
            })?;
        }
        if self.service.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "service.workers".into(),
                detail: "worker count must be > 0".into(),
            });
        }
        if self.ephemeral.block_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ephemeral.block_size".into(),
                detail: "block size must be > 0".into(),
            });
        }
        if self.mapping.id_cache_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mapping.id_cache_ttl_secs".into(),
                detail: "TTL must be > 0".into(),
            });
        }
        if self.mapping.name_cache_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mapping.name_cache_ttl_secs".into(),
                detail: "TTL must be > 0".into(),
            });
        }

        if let Some(ref dir) = self.directory {
            if !(dir.ldap_url.starts_with("ldap://")
                || dir.ldap_url.starts_with("ldaps://")
                || dir.ldap_url.starts_with("ldapi://"))
            {
                return Err(ConfigError::InvalidValue {
                    field: "directory.ldap_url".into(),
                    detail: format!("'{}' is not an LDAP URL", dir.ldap_url),
                });
            }
            if dir.base_dn.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "directory.base_dn".into(),
                    detail: "base DN must not be empty".into(),
                });
            }
            if dir.timeout_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "directory.timeout_secs".into(),
                    detail: "timeout must be > 0".into(),
                });
            }
            if dir.bind_password_env.is_some() && dir.bind_dn.is_none() {
                return Err(ConfigError::InvalidValue {
                    field: "directory.bind_dn".into(),
                    detail: "a bind password is configured without a bind DN".into(),
                });
            }
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML, e.g. for writing a starter config file.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[service]
data_dir = "/tmp/sidmap"
log_level = "debug"
workers = 2

[mapping]
machine_sid = "S-1-5-21-100-200-300"
mapping_domain = "CORP"
id_cache_ttl_secs = 300
ephemeral_unresolved_sids = false

[directory]
ldap_url = "ldap://dc1.corp.example.com"
base_dn = "dc=corp,dc=example,dc=com"
bind_dn = "cn=sidmap,cn=Users,dc=corp,dc=example,dc=com"
bind_password_env = "SIDMAP_TEST_LDAP_PW"
domain_name = "CORP"

[nameservice]
passwd_file = "/tmp/passwd"

[ephemeral]
block_size = 1024
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.service.workers, 2);
        assert_eq!(config.mapping.mapping_domain.as_deref(), Some("CORP"));
        assert_eq!(config.mapping.id_cache_ttl_secs, 300);
        assert_eq!(config.mapping.name_cache_ttl_secs, 3600);
        assert!(!config.mapping.ephemeral_unresolved_sids);
        let dir = config.directory.as_ref().unwrap();
        assert_eq!(dir.timeout_secs, 10);
        assert_eq!(dir.domain_name.as_deref(), Some("CORP"));
        assert_eq!(config.nameservice.group_file, PathBuf::from("/etc/group"));
        assert_eq!(config.ephemeral.block_size, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidmap.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.service.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/sidmap.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.service.data_dir, PathBuf::from("/var/lib/sidmap"));
        assert_eq!(config.service.workers, 4);
        assert_eq!(config.mapping.id_cache_ttl_secs, 600);
        assert!(config.mapping.ephemeral_unresolved_sids);
        assert_eq!(config.ephemeral.block_size, 8192);
        assert_eq!(config.store.busy_warn_secs, 2);
        assert!(config.directory.is_none());
        assert!(config.mapping.machine_sid.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_machine_sid() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.mapping.machine_sid = Some("not-a-sid".into());
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "mapping.machine_sid"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.service.workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "service.workers"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_ldap_url() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.directory.as_mut().unwrap().ldap_url = "http://dc1".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "directory.ldap_url"
        ));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("SIDMAP_TEST_LDAP_PW", "s3cret");

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.resolve_env_vars().unwrap();
        assert_eq!(
            config.directory.as_ref().unwrap().bind_password.as_deref(),
            Some("s3cret")
        );

        std::env::remove_var("SIDMAP_TEST_LDAP_PW");
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = AppConfig::default().to_toml().unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.service.workers, 4);
        assert!(parsed.directory.is_none());
    }
}
