//! Immutable client settings and the connection factory.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rustls::ClientConfig as TlsClientConfig;
use tracing::debug;

use crate::blocking::BlockingConnection;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::controls::PasswordPolicyInfo;
use crate::entry::Entry;
use crate::error::{LdapError, Result};
use crate::sasl::{Credentials, Mechanism, SecurityProperties};
use crate::search::{ReferralPolicy, SearchParams, SearchScope};
use crate::tls::{self, CertPolicy, TlsSettings};
use crate::url::{LdapUrl, Scheme};

/// Attributes requested by [`Client::get_root_dse`].
pub const ROOT_DSE_ATTRIBUTES: [&str; 6] = [
    "namingContexts",
    "altServer",
    "supportedExtension",
    "supportedControl",
    "supportedSASLMechanisms",
    "supportedLDAPVersion",
];

#[derive(Debug)]
struct Settings {
    url: LdapUrl,
    tls: bool,
    tls_settings: TlsSettings,
    tls_config: OnceLock<Arc<TlsClientConfig>>,
    mechanism: Mechanism,
    credentials: Credentials,
    security_properties: SecurityProperties,
    raw_attributes: Vec<String>,
    password_policy: bool,
    extended_dn_format: Option<i32>,
    auto_page_acquire: bool,
    server_chase_referrals: bool,
    ignore_referrals: bool,
    client_chase_referrals: bool,
    managedsait: bool,
    sd_flags: Option<i32>,
    timeout: Option<Duration>,
}

impl Clone for Settings {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            tls: self.tls,
            tls_settings: self.tls_settings.clone(),
            tls_config: match self.tls_config.get() {
                Some(config) => OnceLock::from(config.clone()),
                None => OnceLock::new(),
            },
            mechanism: self.mechanism,
            credentials: self.credentials.clone(),
            security_properties: self.security_properties,
            raw_attributes: self.raw_attributes.clone(),
            password_policy: self.password_policy,
            extended_dn_format: self.extended_dn_format,
            auto_page_acquire: self.auto_page_acquire,
            server_chase_referrals: self.server_chase_referrals,
            ignore_referrals: self.ignore_referrals,
            client_chase_referrals: self.client_chase_referrals,
            managedsait: self.managedsait,
            sd_flags: self.sd_flags,
            timeout: self.timeout,
        }
    }
}

/// Connection factory. Cheap to clone; settings are fixed once built.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Settings>,
}

impl Client {
    pub fn builder(url: &str) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    pub fn new(url: &str) -> Result<Self> {
        ClientBuilder::new(url).build()
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let mut builder = ClientBuilder::new(&config.url)
            .tls(config.tls)
            .cert_policy(config.cert_policy)
            .mechanism(config.mechanism)
            .sasl_credentials(config.credentials.clone())
            .raw_attributes(config.raw_attributes.iter().map(String::as_str))
            .password_policy(config.password_policy)
            .extended_dn_format(config.extended_dn_format)
            .auto_page_acquire(config.auto_page_acquire)
            .server_chase_referrals(config.server_chase_referrals)
            .ignore_referrals(config.ignore_referrals)
            .client_chase_referrals(config.client_chase_referrals)
            .managedsait(config.managedsait)
            .sd_flags(config.sd_flags)
            .security_properties(config.sasl_security_properties);
        if let Some(path) = &config.ca_cert {
            builder = builder.ca_cert(path);
        }
        if let Some(path) = &config.ca_cert_dir {
            builder = builder.ca_cert_dir(path);
        }
        if let Some(path) = &config.client_cert {
            builder = builder.client_cert(path);
        }
        if let Some(path) = &config.client_key {
            builder = builder.client_key(path);
        }
        if let Some(secs) = config.timeout_sec {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        builder.build()
    }

    pub fn url(&self) -> &LdapUrl {
        &self.inner.url
    }

    pub fn tls(&self) -> bool {
        self.inner.tls
    }

    pub fn tls_settings(&self) -> &TlsSettings {
        &self.inner.tls_settings
    }

    pub fn cert_policy(&self) -> CertPolicy {
        self.inner.tls_settings.cert_policy
    }

    /// rustls configuration, built on first use and shared by all
    /// connections of this client.
    pub fn tls_config(&self) -> Result<Arc<TlsClientConfig>> {
        if let Some(config) = self.inner.tls_config.get() {
            return Ok(config.clone());
        }
        let config = tls::build_client_config(&self.inner.tls_settings).map_err(|e| LdapError::Tls(format!("{:#}", e)))?;
        Ok(self.inner.tls_config.get_or_init(|| config).clone())
    }

    pub fn mechanism(&self) -> Mechanism {
        self.inner.mechanism
    }

    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    pub fn security_properties(&self) -> &SecurityProperties {
        &self.inner.security_properties
    }

    pub fn raw_attributes(&self) -> &[String] {
        &self.inner.raw_attributes
    }

    pub fn password_policy(&self) -> bool {
        self.inner.password_policy
    }

    pub fn extended_dn_format(&self) -> Option<i32> {
        self.inner.extended_dn_format
    }

    pub fn auto_page_acquire(&self) -> bool {
        self.inner.auto_page_acquire
    }

    pub fn server_chase_referrals(&self) -> bool {
        self.inner.server_chase_referrals
    }

    pub fn ignore_referrals(&self) -> bool {
        self.inner.ignore_referrals
    }

    pub fn referral_policy(&self) -> ReferralPolicy {
        ReferralPolicy::from_flags(
            self.inner.server_chase_referrals,
            self.inner.ignore_referrals,
            self.inner.client_chase_referrals,
        )
    }

    pub fn managedsait(&self) -> bool {
        self.inner.managedsait
    }

    pub fn sd_flags(&self) -> Option<i32> {
        self.inner.sd_flags
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    fn derive(&self, change: impl FnOnce(&mut Settings)) -> Client {
        let mut settings = (*self.inner).clone();
        change(&mut settings);
        Client {
            inner: Arc::new(settings),
        }
    }

    /// Same settings against another server, used for referral chasing.
    pub fn with_url(&self, url: LdapUrl) -> Client {
        self.derive(|s| {
            if url.scheme() == Scheme::Ldaps {
                s.tls = false;
            }
            s.url = url;
        })
    }

    /// Open and bind a new connection.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<Connection> {
        self.connect_with_policy(timeout).await.map(|(conn, _)| conn)
    }

    /// Like [`connect`](Client::connect), also returning the password policy
    /// response of the bind.
    pub async fn connect_with_policy(&self, timeout: Option<Duration>) -> Result<(Connection, Option<PasswordPolicyInfo>)> {
        let mut conn = Connection::new(self);
        let policy = conn.open(timeout).await?;
        Ok((conn, policy))
    }

    /// Synchronous counterpart of [`connect`](Client::connect).
    pub fn connect_blocking(&self, timeout: Option<Duration>) -> Result<BlockingConnection> {
        BlockingConnection::open(self, timeout).map(|(conn, _)| conn)
    }

    pub fn connect_blocking_with_policy(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(BlockingConnection, Option<PasswordPolicyInfo>)> {
        BlockingConnection::open(self, timeout)
    }

    /// Read the root DSE with an anonymous bind.
    pub async fn get_root_dse(&self) -> Result<Entry> {
        let anonymous = self.derive(|s| {
            s.mechanism = Mechanism::Simple;
            s.credentials = Credentials::default();
            s.password_policy = false;
            s.managedsait = false;
            s.extended_dn_format = None;
            s.sd_flags = None;
        });
        let mut conn = anonymous.connect(None).await?;
        let params = SearchParams::new("", SearchScope::BaseObject, "(objectClass=*)").attrs(ROOT_DSE_ATTRIBUTES);
        let result = conn.search(&params).await;
        conn.close().await;
        let root = result?.into_entries().into_iter().next();
        debug!("Root DSE of {}: {:?}", self.url(), root.as_ref().map(|e| e.keys(true)));
        root.ok_or_else(|| LdapError::NoSuchObject("root DSE is not readable".to_string()))
    }
}

/// Builder for [`Client`]. Validation happens in [`build`](ClientBuilder::build).
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    url: String,
    settings: Settings,
}

impl ClientBuilder {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            settings: Settings {
                url: LdapUrl::default(),
                tls: false,
                tls_settings: TlsSettings::default(),
                tls_config: OnceLock::new(),
                mechanism: Mechanism::Simple,
                credentials: Credentials::default(),
                security_properties: SecurityProperties::default(),
                raw_attributes: Vec::new(),
                password_policy: false,
                extended_dn_format: None,
                auto_page_acquire: false,
                server_chase_referrals: true,
                ignore_referrals: false,
                client_chase_referrals: false,
                managedsait: false,
                sd_flags: None,
                timeout: None,
            },
        }
    }

    /// Issue StartTLS after connecting.
    pub fn tls(mut self, tls: bool) -> Self {
        self.settings.tls = tls;
        self
    }

    pub fn cert_policy(mut self, policy: CertPolicy) -> Self {
        self.settings.tls_settings.cert_policy = policy;
        self
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.tls_settings.ca_cert = Some(path.into());
        self
    }

    pub fn ca_cert_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.tls_settings.ca_cert_dir = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.tls_settings.client_cert = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.tls_settings.client_key = Some(path.into());
        self
    }

    pub fn mechanism(mut self, mechanism: Mechanism) -> Self {
        self.settings.mechanism = mechanism;
        self
    }

    /// Simple-bind DN (or SASL user) and password.
    pub fn credentials(mut self, user: &str, password: &str) -> Self {
        self.settings.credentials = Credentials::new(user, password);
        self
    }

    pub fn sasl_credentials(mut self, credentials: Credentials) -> Self {
        self.settings.credentials = credentials;
        self
    }

    pub fn raw_attributes<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.settings.raw_attributes = attrs.into_iter().map(|a| a.as_ref().to_string()).collect();
        self
    }

    pub fn password_policy(mut self, enabled: bool) -> Self {
        self.settings.password_policy = enabled;
        self
    }

    /// 0 for hex GUID/SID, 1 for the standard string form, `None` to omit
    /// the control.
    pub fn extended_dn_format(mut self, format: Option<i32>) -> Self {
        self.settings.extended_dn_format = format;
        self
    }

    pub fn auto_page_acquire(mut self, enabled: bool) -> Self {
        self.settings.auto_page_acquire = enabled;
        self
    }

    pub fn server_chase_referrals(mut self, enabled: bool) -> Self {
        self.settings.server_chase_referrals = enabled;
        self
    }

    pub fn ignore_referrals(mut self, enabled: bool) -> Self {
        self.settings.ignore_referrals = enabled;
        self
    }

    /// Follow search references on fresh connections with these settings.
    pub fn client_chase_referrals(mut self, enabled: bool) -> Self {
        self.settings.client_chase_referrals = enabled;
        self
    }

    pub fn managedsait(mut self, enabled: bool) -> Self {
        self.settings.managedsait = enabled;
        self
    }

    pub fn sd_flags(mut self, flags: Option<i32>) -> Self {
        self.settings.sd_flags = flags;
        self
    }

    pub fn security_properties(mut self, props: SecurityProperties) -> Self {
        self.settings.security_properties = props;
        self
    }

    /// Default timeout for operations that do not set their own.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Client> {
        let mut settings = self.settings;
        settings.url = LdapUrl::parse(&self.url)?;
        if settings.tls && settings.url.scheme() == Scheme::Ldaps {
            return Err(LdapError::InvalidArgument(
                "StartTLS cannot be combined with an ldaps:// URL".to_string(),
            ));
        }
        if let Some(format) = settings.extended_dn_format {
            if format != 0 && format != 1 {
                return Err(LdapError::InvalidArgument(format!(
                    "extended DN format must be 0 or 1, got {}",
                    format
                )));
            }
        }
        if settings.mechanism == Mechanism::Simple && settings.credentials.password.is_some() && settings.credentials.user.is_none() {
            return Err(LdapError::InvalidArgument("a password needs a bind DN".to_string()));
        }
        Ok(Client {
            inner: Arc::new(settings),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    #[test]
    fn test_builder_defaults() {
        let client = Client::new("ldap://localhost/dc=bonsai,dc=test").unwrap();
        assert_eq!(client.url().port(), 389);
        assert!(!client.tls());
        assert_eq!(client.mechanism(), Mechanism::Simple);
        assert_eq!(client.cert_policy(), CertPolicy::Demand);
        assert_eq!(client.referral_policy(), ReferralPolicy::ServerSide);
        assert!(client.timeout().is_none());
    }

    #[test]
    fn test_builder_validation() {
        assert!(matches!(
            ClientBuilder::new("ldaps://localhost").tls(true).build(),
            Err(LdapError::InvalidArgument(_))
        ));
        assert!(matches!(
            ClientBuilder::new("ldap://localhost").extended_dn_format(Some(2)).build(),
            Err(LdapError::InvalidArgument(_))
        ));
        assert!(ClientBuilder::new("ldap://localhost").extended_dn_format(Some(0)).build().is_ok());
        assert!(ClientBuilder::new("http://localhost").build().is_err());
    }

    #[test]
    fn test_referral_policy_flags() {
        let client = ClientBuilder::new("ldap://localhost")
            .server_chase_referrals(false)
            .build()
            .unwrap();
        assert_eq!(client.referral_policy(), ReferralPolicy::Yield);
        let client = ClientBuilder::new("ldap://localhost")
            .server_chase_referrals(false)
            .ignore_referrals(true)
            .build()
            .unwrap();
        assert_eq!(client.referral_policy(), ReferralPolicy::Drop);
        let client = ClientBuilder::new("ldap://localhost")
            .server_chase_referrals(false)
            .client_chase_referrals(true)
            .build()
            .unwrap();
        assert_eq!(client.referral_policy(), ReferralPolicy::ClientSide);
    }

    #[test]
    fn test_with_url_keeps_credentials() {
        let client = ClientBuilder::new("ldap://localhost")
            .tls(true)
            .credentials("cn=admin,dc=bonsai,dc=test", "secret")
            .build()
            .unwrap();
        let other = client.with_url(LdapUrl::parse("ldaps://other:1636").unwrap());
        assert_eq!(other.url().host(), "other");
        assert!(!other.tls());
        assert_eq!(other.credentials().user.as_deref(), Some("cn=admin,dc=bonsai,dc=test"));
        assert_eq!(client.url().host(), "localhost");
    }

    #[test]
    fn test_tls_config_cached() {
        let client = ClientBuilder::new("ldaps://localhost")
            .cert_policy(CertPolicy::Never)
            .build()
            .unwrap();
        let a = client.tls_config().unwrap();
        let b = client.tls_config().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_tls_config_error() {
        let client = ClientBuilder::new("ldaps://localhost")
            .ca_cert("/nonexistent/ca.pem")
            .build()
            .unwrap();
        assert!(matches!(client.tls_config(), Err(LdapError::Tls(_))));
    }

    #[test]
    fn test_from_config() {
        let config = ClientConfig::from_str(
            r#"
url: "ldap://ldap.example.com"
tls: true
cert_policy: try
mechanism: "NTLM"
credentials:
  user: "EXAMPLE\\jdoe"
  password: "secret"
raw_attributes: ["objectGUID"]
ignore_referrals: true
timeout_sec: 7
"#,
        )
        .unwrap();
        let client = Client::from_config(&config).unwrap();
        assert!(client.tls());
        assert_eq!(client.cert_policy(), CertPolicy::Try);
        assert_eq!(client.mechanism(), Mechanism::Ntlm);
        assert_eq!(client.raw_attributes(), ["objectGUID".to_string()]);
        assert!(client.ignore_referrals());
        assert_eq!(client.timeout(), Some(Duration::from_secs(7)));
    }
}
