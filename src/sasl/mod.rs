//! SASL mechanism drivers for the bind loop.
//!
//! A driver produces the initial response, then one client response per
//! `SaslBindInProgress` challenge, and finally checks the server's closing
//! credentials when the bind succeeds. Drivers are enum-dispatched through
//! [`SaslDriver`].

pub mod digest_md5;
#[cfg(feature = "gssapi")]
pub mod gssapi;
pub mod ntlm;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{LdapError, Result};

/// Authentication mechanism selected on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mechanism {
    #[default]
    #[serde(rename = "SIMPLE")]
    Simple,
    #[serde(rename = "EXTERNAL")]
    External,
    #[serde(rename = "DIGEST-MD5")]
    DigestMd5,
    #[serde(rename = "GSSAPI")]
    Gssapi,
    #[serde(rename = "GSS-SPNEGO")]
    GssSpnego,
    #[serde(rename = "NTLM")]
    Ntlm,
}

impl Mechanism {
    pub fn as_str(self) -> &'static str {
        match self {
            Mechanism::Simple => "SIMPLE",
            Mechanism::External => "EXTERNAL",
            Mechanism::DigestMd5 => "DIGEST-MD5",
            Mechanism::Gssapi => "GSSAPI",
            Mechanism::GssSpnego => "GSS-SPNEGO",
            Mechanism::Ntlm => "NTLM",
        }
    }

    /// Mechanism name sent in the SASL bind. NTLM rides on GSS-SPNEGO with
    /// raw NTLMSSP tokens, which Active Directory accepts.
    pub fn wire_name(self) -> &'static str {
        match self {
            Mechanism::Ntlm => "GSS-SPNEGO",
            other => other.as_str(),
        }
    }

    /// Mechanisms a captured exchange could be brute-forced against.
    fn is_dictionary_attackable(self) -> bool {
        matches!(self, Mechanism::Simple | Mechanism::DigestMd5 | Mechanism::Ntlm)
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mechanism {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SIMPLE" => Ok(Mechanism::Simple),
            "EXTERNAL" => Ok(Mechanism::External),
            "DIGEST-MD5" => Ok(Mechanism::DigestMd5),
            "GSSAPI" => Ok(Mechanism::Gssapi),
            "GSS-SPNEGO" => Ok(Mechanism::GssSpnego),
            "NTLM" => Ok(Mechanism::Ntlm),
            other => Err(LdapError::AuthMethodNotSupported(other.to_string())),
        }
    }
}

/// Bind inputs. Each mechanism reads only the fields it needs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
    pub authz_id: Option<String>,
    pub keytab: Option<PathBuf>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("realm", &self.realm)
            .field("authz_id", &self.authz_id)
            .field("keytab", &self.keytab)
            .finish()
    }
}

impl Credentials {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: Some(user.to_string()),
            password: Some(password.to_string()),
            ..Default::default()
        }
    }

    pub fn with_realm(mut self, realm: &str) -> Self {
        self.realm = Some(realm.to_string());
        self
    }

    pub fn with_authz_id(mut self, authz_id: &str) -> Self {
        self.authz_id = Some(authz_id.to_string());
        self
    }

    pub fn with_keytab(mut self, keytab: impl Into<PathBuf>) -> Self {
        self.keytab = Some(keytab.into());
        self
    }

    fn require_user(&self, mechanism: Mechanism) -> Result<&str> {
        self.user
            .as_deref()
            .ok_or_else(|| LdapError::InvalidArgument(format!("{} requires a user name", mechanism)))
    }

    fn require_password(&self, mechanism: Mechanism) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| LdapError::InvalidArgument(format!("{} requires a password", mechanism)))
    }
}

/// SASL security properties, parsed from the Cyrus-style comma list
/// `noanonymous,noplain,nodict,forwardsec,passcred,minssf=N,maxssf=N,maxbufsize=N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityProperties {
    pub no_anonymous: bool,
    pub no_plain: bool,
    pub no_dict: bool,
    pub forward_sec: bool,
    pub pass_cred: bool,
    pub min_ssf: u32,
    pub max_ssf: u32,
    pub max_bufsize: u32,
}

impl Default for SecurityProperties {
    fn default() -> Self {
        Self {
            no_anonymous: false,
            no_plain: false,
            no_dict: false,
            forward_sec: false,
            pass_cred: false,
            min_ssf: 0,
            max_ssf: u32::MAX,
            max_bufsize: 65536,
        }
    }
}

impl FromStr for SecurityProperties {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Self> {
        let mut props = SecurityProperties::default();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let lower = token.to_ascii_lowercase();
            match lower.split_once('=') {
                Some((key, value)) => {
                    let number: u32 = value.trim().parse().map_err(|_| {
                        LdapError::InvalidArgument(format!("invalid SASL property value: {}", token))
                    })?;
                    match key.trim() {
                        "minssf" => props.min_ssf = number,
                        "maxssf" => props.max_ssf = number,
                        "maxbufsize" => props.max_bufsize = number,
                        _ => return Err(LdapError::InvalidArgument(format!("unknown SASL property: {}", token))),
                    }
                }
                None => match lower.as_str() {
                    "none" => props = SecurityProperties::default(),
                    "noanonymous" => props.no_anonymous = true,
                    "noplain" => props.no_plain = true,
                    "nodict" => props.no_dict = true,
                    "forwardsec" => props.forward_sec = true,
                    "passcred" => props.pass_cred = true,
                    _ => return Err(LdapError::InvalidArgument(format!("unknown SASL property: {}", token))),
                },
            }
        }
        if props.min_ssf > props.max_ssf {
            return Err(LdapError::InvalidArgument(format!(
                "minssf {} exceeds maxssf {}",
                props.min_ssf, props.max_ssf
            )));
        }
        Ok(props)
    }
}

impl fmt::Display for SecurityProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (set, name) in [
            (self.no_anonymous, "noanonymous"),
            (self.no_plain, "noplain"),
            (self.no_dict, "nodict"),
            (self.forward_sec, "forwardsec"),
            (self.pass_cred, "passcred"),
        ] {
            if set {
                parts.push(name.to_string());
            }
        }
        parts.push(format!("minssf={}", self.min_ssf));
        parts.push(format!("maxssf={}", self.max_ssf));
        parts.push(format!("maxbufsize={}", self.max_bufsize));
        f.write_str(&parts.join(","))
    }
}

impl SecurityProperties {
    /// Reject a mechanism the properties rule out. None of the drivers
    /// negotiate a security layer, so any `minssf` above zero fails too.
    pub fn check(&self, mechanism: Mechanism, credentials: &Credentials) -> Result<()> {
        let refuse = |why: &str| Err(LdapError::AuthMethodNotSupported(format!("{}: {}", mechanism, why)));
        if self.no_plain && mechanism == Mechanism::Simple && credentials.password.is_some() {
            return refuse("plaintext passwords are disallowed (noplain)");
        }
        if self.no_anonymous && mechanism == Mechanism::Simple && credentials.password.is_none() {
            return refuse("anonymous bind is disallowed (noanonymous)");
        }
        if self.no_dict && mechanism.is_dictionary_attackable() {
            return refuse("mechanism is open to dictionary attacks (nodict)");
        }
        if self.forward_sec && mechanism != Mechanism::External && !is_kerberos(mechanism) {
            return refuse("mechanism has no forward secrecy (forwardsec)");
        }
        if self.pass_cred && !is_kerberos(mechanism) {
            return refuse("mechanism cannot forward credentials (passcred)");
        }
        if self.min_ssf > 0 && mechanism != Mechanism::External {
            return refuse("security layers are not supported");
        }
        Ok(())
    }
}

fn is_kerberos(mechanism: Mechanism) -> bool {
    matches!(mechanism, Mechanism::Gssapi | Mechanism::GssSpnego)
}

/// A running SASL exchange.
pub enum SaslDriver {
    External(External),
    DigestMd5(digest_md5::DigestMd5),
    Ntlm(ntlm::Ntlm),
    #[cfg(feature = "gssapi")]
    Gssapi(gssapi::Gssapi),
}

impl fmt::Debug for SaslDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SaslDriver").field(&self.mechanism().as_str()).finish()
    }
}

impl SaslDriver {
    /// Prepare the driver for `mechanism` against `host`. SIMPLE is not SASL
    /// and is handled by the connection directly.
    pub fn new(
        mechanism: Mechanism,
        credentials: &Credentials,
        props: &SecurityProperties,
        host: &str,
    ) -> Result<Self> {
        props.check(mechanism, credentials)?;
        match mechanism {
            Mechanism::Simple => Err(LdapError::InvalidArgument("SIMPLE is not a SASL mechanism".to_string())),
            Mechanism::External => Ok(SaslDriver::External(External {
                authz_id: credentials.authz_id.clone(),
            })),
            Mechanism::DigestMd5 => Ok(SaslDriver::DigestMd5(digest_md5::DigestMd5::new(
                credentials.require_user(mechanism)?,
                credentials.require_password(mechanism)?,
                credentials.realm.as_deref(),
                credentials.authz_id.as_deref(),
                host,
                props.max_bufsize,
            ))),
            Mechanism::Ntlm => Ok(SaslDriver::Ntlm(ntlm::Ntlm::new(
                credentials.require_user(mechanism)?,
                credentials.require_password(mechanism)?,
                credentials.realm.as_deref(),
            ))),
            #[cfg(feature = "gssapi")]
            Mechanism::Gssapi | Mechanism::GssSpnego => Ok(SaslDriver::Gssapi(gssapi::Gssapi::new(
                mechanism,
                credentials,
                host,
                props.max_bufsize,
            )?)),
            #[cfg(not(feature = "gssapi"))]
            Mechanism::Gssapi | Mechanism::GssSpnego => Err(LdapError::AuthMethodNotSupported(format!(
                "{} requires the `gssapi` feature",
                mechanism
            ))),
        }
    }

    pub fn mechanism(&self) -> Mechanism {
        match self {
            SaslDriver::External(_) => Mechanism::External,
            SaslDriver::DigestMd5(_) => Mechanism::DigestMd5,
            SaslDriver::Ntlm(_) => Mechanism::Ntlm,
            #[cfg(feature = "gssapi")]
            SaslDriver::Gssapi(g) => g.mechanism(),
        }
    }

    /// Credentials carried in the first BindRequest.
    pub fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            SaslDriver::External(e) => Ok(Some(e.authz_id.clone().unwrap_or_default().into_bytes())),
            SaslDriver::DigestMd5(_) => Ok(None),
            SaslDriver::Ntlm(n) => n.negotiate().map(Some),
            #[cfg(feature = "gssapi")]
            SaslDriver::Gssapi(g) => g.initial_response().map(Some),
        }
    }

    /// Answer a server challenge.
    pub fn step(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        match self {
            SaslDriver::External(_) => Err(LdapError::Sasl("EXTERNAL does not take challenges".to_string())),
            SaslDriver::DigestMd5(d) => d.step(challenge),
            SaslDriver::Ntlm(n) => n.authenticate(challenge),
            #[cfg(feature = "gssapi")]
            SaslDriver::Gssapi(g) => g.step(challenge),
        }
    }

    /// Check the server credentials that accompany the final success.
    pub fn finish(&mut self, server_creds: Option<&[u8]>) -> Result<()> {
        match self {
            SaslDriver::DigestMd5(d) => match server_creds {
                Some(creds) if !creds.is_empty() => d.verify_rspauth(creds),
                _ => Ok(()),
            },
            #[cfg(feature = "gssapi")]
            SaslDriver::Gssapi(g) => match server_creds {
                Some(creds) if !creds.is_empty() => g.finish(creds),
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

/// EXTERNAL: identity comes from the TLS client certificate or the
/// Unix socket peer; only an optional authorization id is sent.
#[derive(Debug, Clone)]
pub struct External {
    authz_id: Option<String>,
}
