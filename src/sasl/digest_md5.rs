//! DIGEST-MD5 (RFC 2831) with `qop=auth`.

use md5::{Digest, Md5};
use rand::Rng;

use crate::error::{LdapError, Result};

pub struct DigestMd5 {
    user: String,
    password: String,
    realm: Option<String>,
    authz_id: Option<String>,
    host: String,
    service: &'static str,
    max_bufsize: u32,
    cnonce: Option<String>,
    expected_rspauth: Option<String>,
}

impl std::fmt::Debug for DigestMd5 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestMd5")
            .field("user", &self.user)
            .field("realm", &self.realm)
            .field("host", &self.host)
            .finish()
    }
}

impl DigestMd5 {
    pub fn new(
        user: &str,
        password: &str,
        realm: Option<&str>,
        authz_id: Option<&str>,
        host: &str,
        max_bufsize: u32,
    ) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            realm: realm.map(str::to_string),
            authz_id: authz_id.map(str::to_string),
            host: host.to_string(),
            service: "ldap",
            max_bufsize,
            cnonce: None,
            expected_rspauth: None,
        }
    }

    fn cnonce(&mut self) -> String {
        self.cnonce
            .get_or_insert_with(|| {
                let bytes: [u8; 16] = rand::thread_rng().gen();
                hex(&bytes)
            })
            .clone()
    }

    /// Answer the server's digest-challenge.
    pub fn step(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        if self.expected_rspauth.is_some() {
            // Second challenge carries rspauth; reply with an empty response.
            self.verify_rspauth(challenge)?;
            return Ok(Vec::new());
        }
        let text = std::str::from_utf8(challenge)
            .map_err(|_| LdapError::Sasl("DIGEST-MD5 challenge is not UTF-8".to_string()))?;
        let directives = parse_directives(text)?;
        let get = |key: &str| {
            directives
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str())
        };

        let nonce = get("nonce").ok_or_else(|| LdapError::Sasl("DIGEST-MD5 challenge without nonce".to_string()))?;
        if let Some(algorithm) = get("algorithm") {
            if !algorithm.eq_ignore_ascii_case("md5-sess") {
                return Err(LdapError::Sasl(format!("unsupported DIGEST-MD5 algorithm {}", algorithm)));
            }
        }
        let qop_offered = get("qop").unwrap_or("auth");
        if !qop_offered.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
            return Err(LdapError::Sasl(format!("server does not offer qop=auth (offered {})", qop_offered)));
        }
        let realm = match &self.realm {
            Some(realm) => realm.clone(),
            None => get("realm").unwrap_or_default().to_string(),
        };
        let utf8 = get("charset").is_some_and(|c| c.eq_ignore_ascii_case("utf-8"));
        let server_max = get("maxbuf").and_then(|m| m.parse::<u32>().ok()).unwrap_or(65536);
        let maxbuf = self.max_bufsize.min(server_max);

        let cnonce = self.cnonce();
        let nc = "00000001";
        let digest_uri = format!("{}/{}", self.service, self.host);

        let a1 = self.a1(&realm, nonce, &cnonce);
        let ha1 = hex(&Md5::digest(&a1));
        let response = kd(&ha1, nonce, nc, &cnonce, &hex(&Md5::digest(format!("AUTHENTICATE:{}", digest_uri))));
        self.expected_rspauth = Some(kd(&ha1, nonce, nc, &cnonce, &hex(&Md5::digest(format!(":{}", digest_uri)))));

        let mut out = format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={},qop=auth,digest-uri=\"{}\",response={}",
            quote(&self.user),
            quote(&realm),
            quote(nonce),
            cnonce,
            nc,
            quote(&digest_uri),
            response
        );
        if maxbuf != 65536 {
            out.push_str(&format!(",maxbuf={}", maxbuf));
        }
        if utf8 {
            out.push_str(",charset=utf-8");
        }
        if let Some(authz) = &self.authz_id {
            out.push_str(&format!(",authzid=\"{}\"", quote(authz)));
        }
        Ok(out.into_bytes())
    }

    /// A1 = H(user:realm:password) ":" nonce ":" cnonce [":" authzid]
    fn a1(&self, realm: &str, nonce: &str, cnonce: &str) -> Vec<u8> {
        let mut a1 = Md5::digest(format!("{}:{}:{}", self.user, realm, self.password)).to_vec();
        a1.extend_from_slice(format!(":{}:{}", nonce, cnonce).as_bytes());
        if let Some(authz) = &self.authz_id {
            a1.extend_from_slice(format!(":{}", authz).as_bytes());
        }
        a1
    }

    /// Check the server's `rspauth=` proof.
    pub fn verify_rspauth(&mut self, data: &[u8]) -> Result<()> {
        let expected = self
            .expected_rspauth
            .as_deref()
            .ok_or_else(|| LdapError::Sasl("rspauth received before the digest response".to_string()))?;
        let text = std::str::from_utf8(data).map_err(|_| LdapError::Sasl("rspauth is not UTF-8".to_string()))?;
        let directives = parse_directives(text)?;
        match directives.iter().find(|(k, _)| k.eq_ignore_ascii_case("rspauth")) {
            Some((_, value)) if value.eq_ignore_ascii_case(expected) => Ok(()),
            Some(_) => Err(LdapError::Sasl("server failed DIGEST-MD5 mutual authentication".to_string())),
            None => Err(LdapError::Sasl("missing rspauth in server response".to_string())),
        }
    }
}

fn kd(ha1: &str, nonce: &str, nc: &str, cnonce: &str, ha2: &str) -> String {
    hex(&Md5::digest(format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2)))
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Split `key=value,key="quoted, value"` into pairs.
fn parse_directives(text: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut chars = text.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(out);
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(LdapError::Sasl(format!("malformed DIGEST-MD5 directive: {}", key.trim())));
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => {
                        if let Some(c) = chars.next() {
                            value.push(c);
                        }
                    }
                    Some('"') => break,
                    Some(c) => value.push(c),
                    None => return Err(LdapError::Sasl("unterminated quoted string".to_string())),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        out.push((key.trim().to_string(), value.trim().to_string()));
    }
}
