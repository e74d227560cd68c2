//! NTLMv2 over SASL: raw NTLMSSP tokens exchanged under the GSS-SPNEGO
//! mechanism name, as Active Directory accepts them.
//!
//! Only authentication is negotiated; no signing or sealing keys are derived.

use hmac::{Hmac, Mac};
use md4::Md4;
use md5::{Digest, Md5};
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{LdapError, Result};

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const CLIENT_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_TARGET_INFO
    | NEGOTIATE_128
    | NEGOTIATE_56;

/// MsvAvTimestamp in the target info block.
const AV_TIMESTAMP: u16 = 7;
const AV_EOL: u16 = 0;

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_EPOCH_OFFSET: u64 = 11_644_473_600;

pub struct Ntlm {
    user: String,
    password: String,
    domain: String,
    client_challenge: Option<[u8; 8]>,
    timestamp: Option<u64>,
}

impl std::fmt::Debug for Ntlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ntlm")
            .field("user", &self.user)
            .field("domain", &self.domain)
            .finish()
    }
}

/// The parts of a CHALLENGE_MESSAGE the client needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_name: String,
    pub target_info: Vec<u8>,
}

impl Ntlm {
    /// `user` may carry the domain as `DOMAIN\user` or `user@domain` when
    /// no realm is given.
    pub fn new(user: &str, password: &str, realm: Option<&str>) -> Self {
        let (domain, user) = match realm {
            Some(realm) => (realm.to_string(), user.to_string()),
            None => split_domain(user),
        };
        Self {
            user,
            password: password.to_string(),
            domain,
            client_challenge: None,
            timestamp: None,
        }
    }

    /// NEGOTIATE_MESSAGE.
    pub fn negotiate(&mut self) -> Result<Vec<u8>> {
        let mut msg = Vec::with_capacity(32);
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&1u32.to_le_bytes());
        msg.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
        // Empty domain and workstation fields.
        msg.extend_from_slice(&[0u8; 16]);
        Ok(msg)
    }

    /// AUTHENTICATE_MESSAGE answering the server's CHALLENGE_MESSAGE.
    pub fn authenticate(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        let challenge = parse_challenge(challenge)?;
        let client_challenge = match self.client_challenge {
            Some(c) => c,
            None => rand::thread_rng().gen(),
        };
        let timestamp = self
            .timestamp
            .or_else(|| av_timestamp(&challenge.target_info))
            .unwrap_or_else(now_filetime);

        let key = ntowf_v2(&self.password, &self.user, &self.domain)?;

        let mut blob = Vec::with_capacity(28 + challenge.target_info.len() + 4);
        blob.extend_from_slice(&[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
        blob.extend_from_slice(&timestamp.to_le_bytes());
        blob.extend_from_slice(&client_challenge);
        blob.extend_from_slice(&[0u8; 4]);
        blob.extend_from_slice(&challenge.target_info);
        blob.extend_from_slice(&[0u8; 4]);

        let nt_proof = hmac_md5(&key, &[&challenge.server_challenge[..], &blob[..]])?;
        let mut nt_response = nt_proof.to_vec();
        nt_response.extend_from_slice(&blob);

        let mut lm_response = hmac_md5(&key, &[&challenge.server_challenge[..], &client_challenge[..]])?.to_vec();
        lm_response.extend_from_slice(&client_challenge);

        let domain = utf16le(&self.domain);
        let user = utf16le(&self.user);
        let workstation: Vec<u8> = Vec::new();
        let session_key: Vec<u8> = Vec::new();

        let flags = (CLIENT_FLAGS & challenge.flags) | NEGOTIATE_UNICODE;
        let mut msg = Vec::with_capacity(64 + lm_response.len() + nt_response.len() + domain.len() + user.len());
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&3u32.to_le_bytes());

        let mut offset = 64u32;
        let fields: [&[u8]; 6] = [&lm_response, &nt_response, &domain, &user, &workstation, &session_key];
        for field in fields {
            let len = u16::try_from(field.len())
                .map_err(|_| LdapError::Sasl("NTLM field exceeds 64 KiB".to_string()))?;
            msg.extend_from_slice(&len.to_le_bytes());
            msg.extend_from_slice(&len.to_le_bytes());
            msg.extend_from_slice(&offset.to_le_bytes());
            offset += len as u32;
        }
        msg.extend_from_slice(&flags.to_le_bytes());
        for field in fields {
            msg.extend_from_slice(field);
        }
        Ok(msg)
    }
}

fn split_domain(user: &str) -> (String, String) {
    if let Some((domain, name)) = user.split_once('\\') {
        (domain.to_string(), name.to_string())
    } else if let Some((name, domain)) = user.rsplit_once('@') {
        (domain.to_string(), name.to_string())
    } else {
        (String::new(), user.to_string())
    }
}

pub fn parse_challenge(data: &[u8]) -> Result<Challenge> {
    let invalid = |what: &str| LdapError::Sasl(format!("invalid NTLM challenge: {}", what));
    if data.len() < 32 || &data[..8] != SIGNATURE {
        return Err(invalid("bad signature"));
    }
    if read_u32(data, 8) != Some(2) {
        return Err(invalid("not a CHALLENGE_MESSAGE"));
    }
    let flags = read_u32(data, 20).ok_or_else(|| invalid("truncated"))?;
    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(&data[24..32]);

    let target_name = match read_field(data, 12) {
        Some(bytes) if flags & NEGOTIATE_UNICODE != 0 => from_utf16le(bytes),
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => return Err(invalid("target name out of range")),
    };
    let target_info = if data.len() >= 48 && flags & NEGOTIATE_TARGET_INFO != 0 {
        read_field(data, 40).ok_or_else(|| invalid("target info out of range"))?.to_vec()
    } else {
        Vec::new()
    };
    Ok(Challenge {
        flags,
        server_challenge,
        target_name,
        target_info,
    })
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Resolve a (len, maxlen, offset) security buffer.
fn read_field(data: &[u8], at: usize) -> Option<&[u8]> {
    let len = read_u16(data, at)? as usize;
    let offset = read_u32(data, at + 4)? as usize;
    if len == 0 {
        return Some(&[]);
    }
    data.get(offset..offset.checked_add(len)?)
}

fn av_timestamp(target_info: &[u8]) -> Option<u64> {
    let mut pos = 0;
    while let (Some(id), Some(len)) = (read_u16(target_info, pos), read_u16(target_info, pos + 2)) {
        let value = target_info.get(pos + 4..pos + 4 + len as usize)?;
        match id {
            AV_EOL => return None,
            AV_TIMESTAMP if value.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(value);
                return Some(u64::from_le_bytes(raw));
            }
            _ => pos += 4 + len as usize,
        }
    }
    None
}

fn now_filetime() -> u64 {
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (since_epoch.as_secs() + FILETIME_EPOCH_OFFSET) * 10_000_000 + u64::from(since_epoch.subsec_nanos() / 100)
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn from_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units)
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16]> {
    let mut mac = HmacMd5::new_from_slice(key).map_err(|e| LdapError::Sasl(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// NTOWFv2 = HMAC-MD5(MD4(UTF-16LE(password)), UTF-16LE(UPPER(user) + domain))
pub fn ntowf_v2(password: &str, user: &str, domain: &str) -> Result<[u8; 16]> {
    let nt_hash = Md4::digest(utf16le(password));
    let identity = utf16le(&format!("{}{}", user.to_uppercase(), domain));
    hmac_md5(&nt_hash, &[&identity[..]])
}
