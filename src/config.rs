use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result};

use crate::sasl::{Credentials, Mechanism, SecurityProperties};
use crate::tls::CertPolicy;

/// Client settings as read from a YAML file. Every field maps onto the
/// `ClientBuilder` option of the same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub url: String,
    /// Issue StartTLS after connecting (plain `ldap://` only).
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub cert_policy: CertPolicy,
    pub ca_cert: Option<PathBuf>,
    pub ca_cert_dir: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    #[serde(default)]
    pub mechanism: Mechanism,
    #[serde(default)]
    pub credentials: Credentials,
    /// Attributes whose values stay as bytes.
    #[serde(default)]
    pub raw_attributes: Vec<String>,
    #[serde(default)]
    pub password_policy: bool,
    /// 0 = hex GUID/SID, 1 = standard string form.
    pub extended_dn_format: Option<i32>,
    #[serde(default)]
    pub auto_page_acquire: bool,
    #[serde(default = "default_true")]
    pub server_chase_referrals: bool,
    #[serde(default)]
    pub ignore_referrals: bool,
    #[serde(default)]
    pub client_chase_referrals: bool,
    #[serde(default)]
    pub managedsait: bool,
    pub sd_flags: Option<i32>,
    #[serde(default)]
    pub sasl_security_properties: SecurityProperties,
    /// Default per-operation timeout in seconds.
    pub timeout_sec: Option<u64>,
    pub pool: Option<PoolConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_minconn")]
    pub minconn: usize,
    #[serde(default = "default_maxconn")]
    pub maxconn: usize,
}

fn default_true() -> bool {
    true
}

fn default_minconn() -> usize {
    1
}

fn default_maxconn() -> usize {
    10
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            minconn: default_minconn(),
            maxconn: default_maxconn(),
        }
    }
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ldap://localhost".to_string(),
            tls: false,
            cert_policy: CertPolicy::default(),
            ca_cert: None,
            ca_cert_dir: None,
            client_cert: None,
            client_key: None,
            mechanism: Mechanism::default(),
            credentials: Credentials::default(),
            raw_attributes: vec![],
            password_policy: false,
            extended_dn_format: None,
            auto_page_acquire: false,
            server_chase_referrals: true,
            ignore_referrals: false,
            client_chase_referrals: false,
            managedsait: false,
            sd_flags: None,
            sasl_security_properties: SecurityProperties::default(),
            timeout_sec: None,
            pool: None,
        }
    }
}
