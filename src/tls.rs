//! TLS client configuration: trust anchors from CA file/dir or system roots,
//! optional client certificate, and the certificate verification policy.

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ClientConfig, WebPkiServerVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Server certificate checking, numbered like the OpenLDAP `TLS_REQCERT` levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertPolicy {
    /// Do not check the certificate at all.
    Never = 0,
    /// Verify and abort the handshake on failure.
    #[default]
    Demand = 2,
    /// Verify, warn on failure, continue.
    Allow = 3,
    /// Verify, continue on failure.
    Try = 4,
}

impl CertPolicy {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl std::str::FromStr for CertPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(CertPolicy::Never),
            "demand" | "hard" => Ok(CertPolicy::Demand),
            "allow" => Ok(CertPolicy::Allow),
            "try" => Ok(CertPolicy::Try),
            other => anyhow::bail!("Invalid cert policy: {}", other),
        }
    }
}

/// Everything needed to build the rustls client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert_policy: CertPolicy,
    pub ca_cert: Option<PathBuf>,
    pub ca_cert_dir: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

pub fn load_certs_from_file(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open cert file: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

pub fn load_private_key_from_file(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path).with_context(|| format!("Open key file: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM PKCS8 keys")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let file = fs::File::open(path).with_context(|| format!("Open key file: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let rsa: Vec<_> = rsa_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM RSA keys")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path.display()))
}

/// Trust anchors: the CA file and every PEM in the CA directory, or the system roots when neither is set.
fn build_root_store(settings: &TlsSettings) -> Result<rustls::RootCertStore> {
    let mut root_store = rustls::RootCertStore::empty();
    if let Some(ref ca) = settings.ca_cert {
        for cert in load_certs_from_file(ca)? {
            root_store.add(cert).context("Add CA certificate")?;
        }
    }
    if let Some(ref dir) = settings.ca_cert_dir {
        let entries = fs::read_dir(dir).with_context(|| format!("Read CA directory: {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            // Hash links and unrelated files are skipped quietly.
            match load_certs_from_file(&path) {
                Ok(found) => {
                    for cert in found {
                        let _ = root_store.add(cert);
                    }
                }
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }
    }
    if settings.ca_cert.is_none() && settings.ca_cert_dir.is_none() {
        for cert in rustls_native_certs::load_native_certs().context("Load system CA certs")? {
            let _ = root_store.add(cert);
        }
    }
    Ok(root_store)
}

pub fn build_client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>> {
    let verifier: Arc<dyn ServerCertVerifier> = match settings.cert_policy {
        CertPolicy::Never => Arc::new(InsecureServerVerifier),
        policy => {
            let roots = Arc::new(build_root_store(settings)?);
            let webpki = WebPkiServerVerifier::builder(roots)
                .build()
                .context("Build certificate verifier")?;
            if policy == CertPolicy::Demand {
                webpki as Arc<dyn ServerCertVerifier>
            } else {
                Arc::new(LenientVerifier { inner: webpki, policy })
            }
        }
    };

    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier);
    let config = match (&settings.client_cert, &settings.client_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs_from_file(cert)?, load_private_key_from_file(key)?)
            .context("Client certificate and key do not match")?,
        (None, None) => builder.with_no_client_auth(),
        _ => anyhow::bail!("client_cert and client_key must be set together"),
    };
    Ok(Arc::new(config))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).with_context(|| format!("Invalid TLS server name: {}", host))
}

/// Accepts every certificate (policy `never`).
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Real verification whose failures are logged instead of fatal (policies `allow` and `try`).
#[derive(Debug)]
struct LenientVerifier {
    inner: Arc<WebPkiServerVerifier>,
    policy: CertPolicy,
}

impl LenientVerifier {
    fn report(&self, what: &str, err: &rustls::Error) {
        if self.policy == CertPolicy::Allow {
            warn!("TLS {} failed, continuing (cert policy allow): {}", what, err);
        } else {
            debug!("TLS {} failed, continuing (cert policy try): {}", what, err);
        }
    }
}

impl ServerCertVerifier for LenientVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
            Ok(ok) => Ok(ok),
            Err(e) => {
                self.report("certificate verification", &e);
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss).or_else(|e| {
            self.report("signature check", &e);
            Ok(HandshakeSignatureValid::assertion())
        })
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss).or_else(|e| {
            self.report("signature check", &e);
            Ok(HandshakeSignatureValid::assertion())
        })
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
