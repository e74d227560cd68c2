//! In-process directory server for integration tests.
//!
//! Speaks enough LDAPv3 through the crate's own codec to exercise the client:
//! simple and DIGEST-MD5 binds with password policy controls, searches with
//! paging, sorting, VLV and referral objects, add/delete/modify/modrdn,
//! compare, Who Am I, Password Modify and StartTLS.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use ldap_session::controls::{
    self, PagedResults, PasswordPolicyInfo, SortRequest, SortResult, VlvRequest, VlvResult, VlvTarget,
};
use ldap_session::ldap_protocol::{
    Attribute, BerWriter, BindAuthentication, BindRequest, BindResponse, CompareRequest, Control, ExtendedRequest,
    ExtendedResponse, LdapMessage, LdapResult, ModifyDNRequest, ModifyOperation, ModifyRequest, ProtocolOp,
    SearchRequest, SearchResultEntry, SearchScope, encode_ldap_message, frame_length, parse_ldap_message,
};
use ldap_session::{DistinguishedName, Filter, PasswordPolicyKind};

pub const BASE: &str = "dc=bonsai,dc=test";
pub const NERDHERD: &str = "ou=nerdherd,dc=bonsai,dc=test";
pub const ADMIN_DN: &str = "cn=admin,dc=bonsai,dc=test";
pub const ADMIN_PASSWORD: &str = "secret";
pub const USER_PASSWORD: &str = "p@ssword";
pub const REALM: &str = "bonsai.test";
pub const GENERATED_PASSWORD: &str = "g3n3r4t3d";
/// Searches below this base never get an answer.
pub const SLOW_BASE: &str = "ou=slow,dc=bonsai,dc=test";

const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
const PASSWORD_MODIFY_OID: &str = "1.3.6.1.4.1.4203.1.11.1";
const DIGEST_NONCE: &str = "OA9BSXrbuRhWay";

#[derive(Debug, Clone)]
pub struct MockEntry {
    pub dn: String,
    pub attrs: Vec<(String, Vec<Vec<u8>>)>,
}

impl MockEntry {
    fn new(dn: &str, attrs: &[(&str, &[&str])]) -> Self {
        Self {
            dn: dn.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.as_bytes().to_vec()).collect()))
                .collect(),
        }
    }

    pub fn values(&self, name: &str) -> Option<&Vec<Vec<u8>>> {
        self.attrs.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v)
    }

    fn values_mut(&mut self, name: &str) -> Option<&mut Vec<Vec<u8>>> {
        self.attrs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v)
    }

    pub fn first(&self, name: &str) -> Option<String> {
        self.values(name)
            .and_then(|v| v.first())
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    fn is_referral(&self) -> bool {
        self.values("objectClass")
            .is_some_and(|v| v.iter().any(|c| c.eq_ignore_ascii_case(b"referral")))
    }
}

/// Entries keyed by DN, kept in insertion order so result order is stable.
#[derive(Debug, Default)]
pub struct Store(Vec<(DistinguishedName, MockEntry)>);

impl Store {
    pub fn get(&self, dn: &DistinguishedName) -> Option<&MockEntry> {
        self.0.iter().find(|(k, _)| k == dn).map(|(_, e)| e)
    }

    fn get_mut(&mut self, dn: &DistinguishedName) -> Option<&mut MockEntry> {
        self.0.iter_mut().find(|(k, _)| k == dn).map(|(_, e)| e)
    }

    pub fn contains_key(&self, dn: &DistinguishedName) -> bool {
        self.get(dn).is_some()
    }

    fn insert(&mut self, dn: DistinguishedName, entry: MockEntry) {
        match self.get_mut(&dn) {
            Some(existing) => *existing = entry,
            None => self.0.push((dn, entry)),
        }
    }

    fn remove(&mut self, dn: &DistinguishedName) {
        self.0.retain(|(k, _)| k != dn);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DistinguishedName, &MockEntry)> {
        self.0.iter().map(|(k, e)| (k, e))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Server-side state shared by all connections.
#[derive(Debug, Default)]
pub struct Directory {
    pub entries: Store,
    pub modify_requests: Vec<ModifyRequest>,
    pub search_controls: Vec<Vec<Control>>,
    pub request_controls: Vec<(String, Vec<Control>)>,
    pub abandoned: Vec<i32>,
    pub binds: usize,
}

impl Directory {
    fn insert(&mut self, entry: MockEntry) {
        if let Ok(dn) = DistinguishedName::parse(&entry.dn) {
            self.entries.insert(dn, entry);
        }
    }

    pub fn get(&self, dn: &str) -> Option<&MockEntry> {
        DistinguishedName::parse(dn).ok().and_then(|dn| self.entries.get(&dn))
    }

    fn seed(&mut self, port: u16) {
        self.insert(MockEntry::new(
            BASE,
            &[("objectClass", &["top", "dcObject", "organization"]), ("dc", &["bonsai"]), ("o", &["bonsai"])],
        ));
        self.insert(MockEntry::new(
            ADMIN_DN,
            &[("objectClass", &["person"]), ("cn", &["admin"]), ("sn", &["admin"]), ("userPassword", &[ADMIN_PASSWORD])],
        ));
        self.insert(MockEntry::new(
            NERDHERD,
            &[("objectClass", &["organizationalUnit"]), ("ou", &["nerdherd"])],
        ));
        let people = [
            ("chuck", "Bartowski", "Chuck", "1004"),
            ("sarah", "Walker", "Sarah", "1003"),
            ("morgan", "Grimes", "Morgan", "1002"),
            ("casey", "Casey", "John", "1001"),
            ("jeff", "Barnes", "Jeff", "1006"),
            ("lester", "Patel", "Lester", "1005"),
        ];
        for (cn, sn, given, uid_number) in people {
            let dn = format!("cn={},{}", cn, NERDHERD);
            let mail = format!("{}@bonsai.test", cn);
            self.insert(MockEntry::new(
                &dn,
                &[
                    ("objectClass", &["top", "inetOrgPerson", "posixAccount"]),
                    ("cn", &[cn]),
                    ("sn", &[sn]),
                    ("givenName", &[given]),
                    ("uid", &[cn]),
                    ("uidNumber", &[uid_number]),
                    ("mail", &[mail.as_str()]),
                    ("userPassword", &[USER_PASSWORD]),
                ],
            ));
        }
        let referral = format!("ldap://127.0.0.1:{}/{}", port, NERDHERD);
        self.insert(MockEntry::new(
            "ou=ref,dc=bonsai,dc=test",
            &[("objectClass", &["referral", "extensibleObject"]), ("ou", &["ref"]), ("ref", &[referral.as_str()])],
        ));
        self.insert(MockEntry::new(
            "ou=ppolicy,dc=bonsai,dc=test",
            &[("objectClass", &["organizationalUnit"]), ("ou", &["ppolicy"])],
        ));
        for cn in ["expiring", "grace", "expired", "locked"] {
            let dn = format!("cn={},ou=ppolicy,dc=bonsai,dc=test", cn);
            self.insert(MockEntry::new(
                &dn,
                &[("objectClass", &["person"]), ("cn", &[cn]), ("sn", &[cn]), ("userPassword", &[USER_PASSWORD])],
            ));
        }
    }

    fn children(&self, dn: &DistinguishedName) -> Vec<DistinguishedName> {
        self.entries
            .iter()
            .filter(|(k, _)| k.parent().as_ref() == Some(dn))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

pub struct MockServer {
    pub url: String,
    pub port: u16,
    pub directory: Arc<Mutex<Directory>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn data_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("data").join(name)
}

fn tls_acceptor() -> TlsAcceptor {
    let certs = ldap_session::tls::load_certs_from_file(&data_path("localhost.crt")).unwrap();
    let key = ldap_session::tls::load_private_key_from_file(&data_path("localhost.key")).unwrap();
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

impl MockServer {
    pub async fn start() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let directory = Arc::new(Mutex::new(Directory::default()));
        directory.lock().unwrap().seed(port);
        let acceptor = tls_acceptor();
        let shared = directory.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let directory = shared.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    serve(stream, directory, acceptor).await;
                });
            }
        });
        MockServer {
            url: format!("ldap://127.0.0.1:{}", port),
            port,
            directory,
            task,
        }
    }

    pub fn url_with_base(&self, base: &str) -> String {
        format!("{}/{}", self.url, base)
    }

    pub fn dir(&self) -> std::sync::MutexGuard<'_, Directory> {
        self.directory.lock().unwrap()
    }
}

enum SessionEnd {
    Closed,
    StartTls(Vec<u8>),
}

#[derive(Default)]
struct Session {
    bound: Option<String>,
    tls: bool,
    digest_user: Option<String>,
}

async fn serve(stream: TcpStream, directory: Arc<Mutex<Directory>>, acceptor: TlsAcceptor) {
    let mut stream = stream;
    let mut session = Session::default();
    match run(&mut stream, Vec::new(), &directory, &mut session).await {
        SessionEnd::Closed => {}
        SessionEnd::StartTls(_) => {
            let Ok(mut tls) = acceptor.accept(stream).await else {
                return;
            };
            session.tls = true;
            run(&mut tls, Vec::new(), &directory, &mut session).await;
        }
    }
}

async fn run<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    mut buf: Vec<u8>,
    directory: &Arc<Mutex<Directory>>,
    session: &mut Session,
) -> SessionEnd {
    loop {
        let len = loop {
            match frame_length(&buf) {
                Ok(Some(len)) => break len,
                Ok(None) => {}
                Err(_) => return SessionEnd::Closed,
            }
            let mut chunk = [0u8; 8192];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return SessionEnd::Closed,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let pdu: Vec<u8> = buf.drain(..len).collect();
        let Ok(message) = parse_ldap_message(&pdu) else {
            return SessionEnd::Closed;
        };
        let id = message.message_id;
        let controls = message.controls.clone().unwrap_or_default();
        directory
            .lock()
            .unwrap()
            .request_controls
            .push((message.protocol_op.name().to_string(), controls.clone()));

        let replies: Vec<(ProtocolOp, Vec<Control>)> = match message.protocol_op {
            ProtocolOp::UnbindRequest => return SessionEnd::Closed,
            ProtocolOp::AbandonRequest(target) => {
                directory.lock().unwrap().abandoned.push(target);
                Vec::new()
            }
            ProtocolOp::BindRequest(req) => vec![bind(req, &controls, directory, session)],
            ProtocolOp::SearchRequest(req) => {
                if is_below(&req.base_object, SLOW_BASE) {
                    Vec::new()
                } else {
                    search(req, &controls, directory)
                }
            }
            ProtocolOp::AddRequest(req) => {
                let mut dir = directory.lock().unwrap();
                let entry = MockEntry {
                    dn: req.entry.clone(),
                    attrs: req.attributes.into_iter().map(|a| (a.attr_type, a.attr_values)).collect(),
                };
                vec![(ProtocolOp::AddResponse(add(&mut dir, entry)), Vec::new())]
            }
            ProtocolOp::DelRequest(req) => {
                let mut dir = directory.lock().unwrap();
                vec![(ProtocolOp::DelResponse(delete(&mut dir, &req.entry)), Vec::new())]
            }
            ProtocolOp::ModifyRequest(req) => {
                let mut dir = directory.lock().unwrap();
                dir.modify_requests.push(req.clone());
                let managedsait = controls::find(&controls, controls::MANAGE_DSA_IT_OID).is_some();
                vec![(ProtocolOp::ModifyResponse(modify(&mut dir, req, managedsait)), Vec::new())]
            }
            ProtocolOp::ModifyDNRequest(req) => {
                let mut dir = directory.lock().unwrap();
                vec![(ProtocolOp::ModifyDNResponse(rename(&mut dir, req)), Vec::new())]
            }
            ProtocolOp::CompareRequest(req) => {
                let dir = directory.lock().unwrap();
                vec![(ProtocolOp::CompareResponse(compare(&dir, req)), Vec::new())]
            }
            ProtocolOp::ExtendedRequest(req) if req.request_name == START_TLS_OID => {
                let result = if session.tls {
                    LdapResult::with_code(1, "TLS already started")
                } else {
                    LdapResult::success()
                };
                let upgrade = result.result_code == 0;
                send(stream, id, extended_response(result, None), Vec::new()).await;
                if upgrade {
                    return SessionEnd::StartTls(buf);
                }
                Vec::new()
            }
            ProtocolOp::ExtendedRequest(req) => vec![extended(req, &controls, directory, session)],
            _ => return SessionEnd::Closed,
        };
        for (op, controls) in replies {
            if !send(stream, id, op, controls).await {
                return SessionEnd::Closed;
            }
        }
    }
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, id: i32, op: ProtocolOp, controls: Vec<Control>) -> bool {
    let message = LdapMessage {
        message_id: id,
        protocol_op: op,
        controls: if controls.is_empty() { None } else { Some(controls) },
    };
    let Ok(pdu) = encode_ldap_message(&message) else {
        return false;
    };
    stream.write_all(&pdu).await.is_ok()
}

fn extended_response(result: LdapResult, value: Option<Vec<u8>>) -> ProtocolOp {
    ProtocolOp::ExtendedResponse(ExtendedResponse {
        result,
        response_name: None,
        response_value: value,
    })
}

fn is_below(dn: &str, base: &str) -> bool {
    match (DistinguishedName::parse(dn), DistinguishedName::parse(base)) {
        (Ok(dn), Ok(base)) => dn.is_within(&base),
        _ => false,
    }
}

fn policy_control(info: PasswordPolicyInfo) -> Vec<Control> {
    vec![info.to_control()]
}

fn bind(
    req: BindRequest,
    controls: &[Control],
    directory: &Arc<Mutex<Directory>>,
    session: &mut Session,
) -> (ProtocolOp, Vec<Control>) {
    let wants_policy = controls::find(controls, controls::PASSWORD_POLICY_OID).is_some();
    let mut dir = directory.lock().unwrap();
    dir.binds += 1;
    let reply = |result: LdapResult, creds: Option<Vec<u8>>| {
        ProtocolOp::BindResponse(BindResponse {
            result,
            server_sasl_creds: creds,
        })
    };
    match req.authentication {
        BindAuthentication::Simple(password) => {
            if req.name.is_empty() && password.is_empty() {
                session.bound = None;
                return (reply(LdapResult::success(), None), Vec::new());
            }
            let Some(entry) = dir.get(&req.name) else {
                return (reply(LdapResult::with_code(49, "invalid credentials"), None), Vec::new());
            };
            let valid = entry
                .values("userPassword")
                .is_some_and(|v| v.iter().any(|p| *p == password));
            if !valid {
                return (reply(LdapResult::with_code(49, "invalid credentials"), None), Vec::new());
            }
            let cn = entry.first("cn").unwrap_or_default();
            let (result, policy) = match cn.as_str() {
                "expiring" => (LdapResult::success(), Some(PasswordPolicyInfo { expire: Some(7), ..Default::default() })),
                "grace" => (LdapResult::success(), Some(PasswordPolicyInfo { grace: Some(1), ..Default::default() })),
                "expired" => (
                    LdapResult::with_code(49, "password expired"),
                    Some(PasswordPolicyInfo {
                        error: Some(PasswordPolicyKind::Expired),
                        ..Default::default()
                    }),
                ),
                "locked" => (
                    LdapResult::with_code(49, "account locked"),
                    Some(PasswordPolicyInfo {
                        error: Some(PasswordPolicyKind::AccountLocked),
                        ..Default::default()
                    }),
                ),
                _ => (LdapResult::success(), None),
            };
            if result.result_code == 0 {
                session.bound = Some(entry.dn.clone());
            }
            let controls = match policy {
                Some(info) if wants_policy => policy_control(info),
                _ => Vec::new(),
            };
            (reply(result, None), controls)
        }
        BindAuthentication::Sasl { mechanism, credentials } => match mechanism.as_str() {
            "EXTERNAL" if session.tls => {
                session.bound = Some("cn=external,dc=bonsai,dc=test".to_string());
                (reply(LdapResult::success(), None), Vec::new())
            }
            "DIGEST-MD5" => match credentials {
                None => {
                    let challenge = format!(
                        "realm=\"{}\",nonce=\"{}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess",
                        REALM, DIGEST_NONCE
                    );
                    (reply(LdapResult::with_code(14, ""), Some(challenge.into_bytes())), Vec::new())
                }
                Some(response) => match verify_digest(&dir, &response) {
                    Some((user, rspauth)) => {
                        session.bound = Some(format!("cn={},{}", user, NERDHERD));
                        session.digest_user = Some(user);
                        let creds = format!("rspauth={}", rspauth).into_bytes();
                        (reply(LdapResult::success(), Some(creds)), Vec::new())
                    }
                    None => (reply(LdapResult::with_code(49, "digest mismatch"), None), Vec::new()),
                },
            },
            other => (
                reply(LdapResult::with_code(7, &format!("{} not supported", other)), None),
                Vec::new(),
            ),
        },
    }
}

fn directives(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim_matches(|c: char| c == ',' || c.is_whitespace()).to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').unwrap_or(stripped.len());
            value = stripped[..end].to_string();
            rest = stripped.get(end + 1..).unwrap_or("");
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].to_string();
            rest = &rest[end..];
        }
        out.push((key, value));
        rest = rest.trim_start_matches(',');
    }
    out
}

fn md5_hex(data: &[u8]) -> String {
    Md5::digest(data).iter().map(|b| format!("{:02x}", b)).collect()
}

/// Returns the user and the rspauth value when the digest response checks out.
fn verify_digest(dir: &Directory, response: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(response).ok()?;
    let d = directives(text);
    let get = |k: &str| d.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
    let user = get("username")?;
    let realm = get("realm")?;
    let cnonce = get("cnonce")?;
    let nc = get("nc")?;
    let uri = get("digest-uri")?;
    if get("nonce")? != DIGEST_NONCE {
        return None;
    }
    let entry = dir.get(&format!("cn={},{}", user, NERDHERD))?;
    let password = entry.first("userPassword")?;
    let mut a1 = Md5::digest(format!("{}:{}:{}", user, realm, password)).to_vec();
    a1.extend_from_slice(format!(":{}:{}", DIGEST_NONCE, cnonce).as_bytes());
    if let Some(authz) = get("authzid") {
        a1.extend_from_slice(format!(":{}", authz).as_bytes());
    }
    let ha1 = md5_hex(&a1);
    let kd = |a2: String| md5_hex(format!("{}:{}:{}:{}:auth:{}", ha1, DIGEST_NONCE, nc, cnonce, md5_hex(a2.as_bytes())).as_bytes());
    if kd(format!("AUTHENTICATE:{}", uri)) != get("response")? {
        return None;
    }
    Some((user, kd(format!(":{}", uri))))
}

fn matches(filter: &Filter, entry: &MockEntry) -> bool {
    let eq = |a: &[u8], b: &[u8]| a.eq_ignore_ascii_case(b);
    match filter {
        Filter::And(fs) => fs.iter().all(|f| matches(f, entry)),
        Filter::Or(fs) => fs.iter().any(|f| matches(f, entry)),
        Filter::Not(f) => !matches(f, entry),
        Filter::Present(attr) => entry.values(attr).is_some(),
        Filter::Equality(attr, value) | Filter::Approx(attr, value) => {
            entry.values(attr).is_some_and(|vs| vs.iter().any(|v| eq(v, value)))
        }
        Filter::GreaterOrEqual(attr, value) => entry
            .values(attr)
            .is_some_and(|vs| vs.iter().any(|v| compare_values(v, value) != std::cmp::Ordering::Less)),
        Filter::LessOrEqual(attr, value) => entry
            .values(attr)
            .is_some_and(|vs| vs.iter().any(|v| compare_values(v, value) != std::cmp::Ordering::Greater)),
        Filter::Substrings {
            attr,
            initial,
            any,
            final_,
        } => entry.values(attr).is_some_and(|vs| {
            vs.iter().any(|v| {
                let v = String::from_utf8_lossy(v).to_lowercase();
                let mut rest = v.as_str();
                if let Some(init) = initial {
                    let init = String::from_utf8_lossy(init).to_lowercase();
                    match rest.strip_prefix(init.as_str()) {
                        Some(r) => rest = r,
                        None => return false,
                    }
                }
                for part in any {
                    let part = String::from_utf8_lossy(part).to_lowercase();
                    match rest.find(part.as_str()) {
                        Some(i) => rest = &rest[i + part.len()..],
                        None => return false,
                    }
                }
                match final_ {
                    Some(fin) => rest.ends_with(String::from_utf8_lossy(fin).to_lowercase().as_str()),
                    None => true,
                }
            })
        }),
        Filter::ExtensibleMatch { .. } => false,
    }
}

fn compare_values(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    let parse = |v: &[u8]| std::str::from_utf8(v).ok().and_then(|s| s.parse::<i64>().ok());
    match (parse(a), parse(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()),
    }
}

fn project(entry: &MockEntry, req: &SearchRequest) -> SearchResultEntry {
    let wanted = |name: &str| {
        req.attributes.is_empty()
            || req.attributes.iter().any(|a| a == "*" || a.eq_ignore_ascii_case(name))
    };
    let no_attrs = req.attributes.len() == 1 && req.attributes[0] == "1.1";
    let attributes = if no_attrs {
        Vec::new()
    } else {
        entry
            .attrs
            .iter()
            .filter(|(k, _)| wanted(k))
            .map(|(k, vs)| Attribute {
                attr_type: k.clone(),
                attr_values: if req.types_only { Vec::new() } else { vs.clone() },
            })
            .collect()
    };
    SearchResultEntry {
        object_name: entry.dn.clone(),
        attributes,
    }
}

fn root_dse() -> MockEntry {
    MockEntry::new(
        "",
        &[
            ("objectClass", &["top"]),
            ("namingContexts", &[BASE]),
            ("supportedLDAPVersion", &["3"]),
            ("supportedSASLMechanisms", &["DIGEST-MD5", "EXTERNAL"]),
            ("supportedExtension", &[START_TLS_OID, WHOAMI_OID, PASSWORD_MODIFY_OID]),
            ("supportedControl", &[controls::PAGED_RESULTS_OID, controls::SORT_REQUEST_OID, controls::VLV_REQUEST_OID]),
        ],
    )
}

fn search(req: SearchRequest, controls: &[Control], directory: &Arc<Mutex<Directory>>) -> Vec<(ProtocolOp, Vec<Control>)> {
    let mut dir = directory.lock().unwrap();
    dir.search_controls.push(controls.to_vec());
    let done = |result: LdapResult, controls: Vec<Control>| (ProtocolOp::SearchResultDone(result), controls);

    if req.base_object.is_empty() && req.scope == SearchScope::BaseObject {
        let entry = root_dse();
        if matches(&req.filter, &entry) {
            return vec![
                (ProtocolOp::SearchResultEntry(project(&entry, &req)), Vec::new()),
                done(LdapResult::success(), Vec::new()),
            ];
        }
        return vec![done(LdapResult::success(), Vec::new())];
    }
    let Ok(base) = DistinguishedName::parse(&req.base_object) else {
        return vec![done(LdapResult::with_code(0x22, "invalid DN"), Vec::new())];
    };
    let Some(base_entry) = dir.entries.get(&base) else {
        return vec![done(LdapResult::with_code(0x20, "no such object"), Vec::new())];
    };
    let managedsait = controls::find(controls, controls::MANAGE_DSA_IT_OID).is_some();
    if base_entry.is_referral() && !managedsait {
        let mut result = LdapResult::with_code(0x0A, "referral");
        result.referrals = base_entry.values("ref").cloned().unwrap_or_default()
            .into_iter()
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .collect();
        return vec![done(result, Vec::new())];
    }

    let mut found: Vec<MockEntry> = Vec::new();
    let mut references: Vec<Vec<String>> = Vec::new();
    for (dn, entry) in dir.entries.iter() {
        let in_scope = match req.scope {
            SearchScope::BaseObject => *dn == base,
            SearchScope::SingleLevel => dn.parent().as_ref() == Some(&base),
            SearchScope::WholeSubtree => dn.is_within(&base),
        };
        if !in_scope {
            continue;
        }
        if entry.is_referral() && !managedsait && *dn != base {
            references.push(
                entry
                    .values("ref")
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|v| String::from_utf8_lossy(&v).into_owned())
                    .collect(),
            );
            continue;
        }
        if matches(&req.filter, entry) {
            found.push(entry.clone());
        }
    }

    let mut response_controls = Vec::new();
    let sort = controls::find(controls, controls::SORT_REQUEST_OID)
        .and_then(|c| c.value.as_deref())
        .and_then(|v| SortRequest::parse(v).ok());
    if let Some(sort) = &sort {
        for key in sort.keys.iter().rev() {
            found.sort_by(|a, b| {
                let av = a.values(&key.attr).and_then(|v| v.first()).cloned().unwrap_or_default();
                let bv = b.values(&key.attr).and_then(|v| v.first()).cloned().unwrap_or_default();
                let ord = compare_values(&av, &bv);
                if key.reverse { ord.reverse() } else { ord }
            });
        }
        response_controls.push(SortResult { result: 0, attr: None }.to_control());
    }

    if let Some(vlv) = controls::find(controls, controls::VLV_REQUEST_OID)
        .and_then(|c| c.value.as_deref())
        .and_then(|v| VlvRequest::parse(v).ok())
    {
        if sort.is_none() {
            return vec![done(LdapResult::with_code(0x35, "VLV requires server-side sorting"), Vec::new())];
        }
        let count = found.len() as i32;
        let offset = match vlv.target {
            VlvTarget::ByOffset { offset, .. } => offset.clamp(1, count.max(1)),
            VlvTarget::GreaterOrEqual(value) => {
                let key = sort.as_ref().and_then(|s| s.keys.first()).map(|k| k.attr.clone()).unwrap_or_default();
                found
                    .iter()
                    .position(|e| {
                        e.values(&key)
                            .and_then(|v| v.first())
                            .is_some_and(|v| compare_values(v, &value) != std::cmp::Ordering::Less)
                    })
                    .map(|p| p as i32 + 1)
                    .unwrap_or(count)
            }
        };
        let start = (offset - vlv.before_count).max(1) as usize;
        let end = (offset + vlv.after_count).min(count) as usize;
        found = if start <= end { found[start - 1..end].to_vec() } else { Vec::new() };
        response_controls.push(
            VlvResult {
                target_position: offset,
                list_count: count,
                result: 0,
                context_id: Some(b"vlv-ctx".to_vec()),
            }
            .to_control(),
        );
    }

    if let Some(paged) = controls::find(controls, controls::PAGED_RESULTS_OID)
        .and_then(|c| c.value.as_deref())
        .and_then(|v| PagedResults::parse(v).ok())
    {
        let start: usize = std::str::from_utf8(&paged.cookie).ok().and_then(|s| s.parse().ok()).unwrap_or(0);
        let size = paged.size.max(1) as usize;
        let end = (start + size).min(found.len());
        let cookie = if end < found.len() { end.to_string().into_bytes() } else { Vec::new() };
        found = found.get(start..end).map(<[MockEntry]>::to_vec).unwrap_or_default();
        response_controls.push(
            PagedResults {
                size: 0,
                cookie,
            }
            .into(),
        );
        references.clear();
    }

    let mut out = Vec::new();
    let limit = if req.size_limit > 0 { req.size_limit as usize } else { usize::MAX };
    for (sent, entry) in found.iter().enumerate() {
        if sent == limit {
            out.push(done(LdapResult::with_code(0x04, "size limit exceeded"), Vec::new()));
            return out;
        }
        out.push((ProtocolOp::SearchResultEntry(project(entry, &req)), Vec::new()));
    }
    for urls in references {
        out.push((ProtocolOp::SearchResultReference(urls), Vec::new()));
    }
    out.push(done(LdapResult::success(), response_controls));
    out
}

fn add(dir: &mut Directory, entry: MockEntry) -> LdapResult {
    let Ok(dn) = DistinguishedName::parse(&entry.dn) else {
        return LdapResult::with_code(0x22, "invalid DN");
    };
    if dir.entries.contains_key(&dn) {
        return LdapResult::with_code(0x44, "already exists");
    }
    match dn.parent() {
        Some(parent) if dir.entries.contains_key(&parent) => {}
        _ => return LdapResult::with_code(0x20, "parent does not exist"),
    }
    if entry.values("objectClass").is_none() {
        return LdapResult::with_code(0x41, "no objectClass attribute");
    }
    dir.entries.insert(dn, entry);
    LdapResult::success()
}

fn delete(dir: &mut Directory, dn: &str) -> LdapResult {
    let Ok(dn) = DistinguishedName::parse(dn) else {
        return LdapResult::with_code(0x22, "invalid DN");
    };
    if !dir.entries.contains_key(&dn) {
        return LdapResult::with_code(0x20, "no such object");
    }
    if !dir.children(&dn).is_empty() {
        return LdapResult::with_code(0x42, "subordinate objects must be deleted first");
    }
    dir.entries.remove(&dn);
    LdapResult::success()
}

fn modify(dir: &mut Directory, req: ModifyRequest, managedsait: bool) -> LdapResult {
    let Ok(dn) = DistinguishedName::parse(&req.object) else {
        return LdapResult::with_code(0x22, "invalid DN");
    };
    let Some(current) = dir.entries.get(&dn) else {
        return LdapResult::with_code(0x20, "no such object");
    };
    if current.is_referral() && !managedsait {
        let mut result = LdapResult::with_code(0x0A, "referral");
        result.referrals = current
            .values("ref")
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .collect();
        return result;
    }
    let mut entry = current.clone();
    for change in req.changes {
        let attr = change.modification.attr_type;
        let values = change.modification.attr_values;
        match change.operation {
            ModifyOperation::Add => match entry.values_mut(&attr) {
                Some(existing) => {
                    for v in values {
                        if existing.iter().any(|e| e.eq_ignore_ascii_case(&v)) {
                            return LdapResult::with_code(0x14, "value already exists");
                        }
                        existing.push(v);
                    }
                }
                None => entry.attrs.push((attr, values)),
            },
            ModifyOperation::Delete => {
                let Some(existing) = entry.values_mut(&attr) else {
                    return LdapResult::with_code(0x10, "no such attribute");
                };
                if values.is_empty() {
                    existing.clear();
                } else {
                    for v in values {
                        let before = existing.len();
                        existing.retain(|e| !e.eq_ignore_ascii_case(&v));
                        if existing.len() == before {
                            return LdapResult::with_code(0x10, "no such value");
                        }
                    }
                }
                entry.attrs.retain(|(_, vs)| !vs.is_empty());
            }
            ModifyOperation::Replace => {
                entry.attrs.retain(|(k, _)| !k.eq_ignore_ascii_case(&attr));
                if !values.is_empty() {
                    entry.attrs.push((attr, values));
                }
            }
        }
    }
    dir.entries.insert(dn, entry);
    LdapResult::success()
}

fn rename(dir: &mut Directory, req: ModifyDNRequest) -> LdapResult {
    let Ok(dn) = DistinguishedName::parse(&req.entry) else {
        return LdapResult::with_code(0x22, "invalid DN");
    };
    let Some(mut entry) = dir.entries.get(&dn).cloned() else {
        return LdapResult::with_code(0x20, "no such object");
    };
    if !dir.children(&dn).is_empty() {
        return LdapResult::with_code(0x42, "subtree rename not supported");
    }
    let parent = match &req.new_superior {
        Some(sup) => sup.clone(),
        None => dn.parent().map(|p| p.to_string()).unwrap_or_default(),
    };
    let new_dn_text = if parent.is_empty() { req.newrdn.clone() } else { format!("{},{}", req.newrdn, parent) };
    let Ok(new_dn) = DistinguishedName::parse(&new_dn_text) else {
        return LdapResult::with_code(0x22, "invalid DN");
    };
    if dir.entries.contains_key(&new_dn) {
        return LdapResult::with_code(0x44, "already exists");
    }
    let (rdn_attr, rdn_value) = req.newrdn.split_once('=').unwrap_or(("cn", ""));
    if req.delete_old_rdn {
        if let Some((old_attr, old_value)) = dn.rdns().first().and_then(|r| r.first()) {
            if let Some(values) = entry.values_mut(old_attr) {
                values.retain(|v| !v.eq_ignore_ascii_case(old_value.as_bytes()));
            }
        }
    }
    match entry.values_mut(rdn_attr) {
        Some(values) if !values.iter().any(|v| v.eq_ignore_ascii_case(rdn_value.as_bytes())) => {
            values.push(rdn_value.as_bytes().to_vec())
        }
        Some(_) => {}
        None => entry.attrs.push((rdn_attr.to_string(), vec![rdn_value.as_bytes().to_vec()])),
    }
    entry.attrs.retain(|(_, vs)| !vs.is_empty());
    entry.dn = new_dn.to_string();
    dir.entries.remove(&dn);
    dir.entries.insert(new_dn, entry);
    LdapResult::success()
}

fn compare(dir: &Directory, req: CompareRequest) -> LdapResult {
    let Some(entry) = dir.get(&req.entry) else {
        return LdapResult::with_code(0x20, "no such object");
    };
    let Some(values) = entry.values(&req.attr) else {
        return LdapResult::with_code(0x10, "no such attribute");
    };
    if values.iter().any(|v| v.eq_ignore_ascii_case(&req.assertion_value)) {
        LdapResult::with_code(6, "")
    } else {
        LdapResult::with_code(5, "")
    }
}

/// Split a SEQUENCE of context-tagged primitives into (tag, value) pairs.
fn tagged_fields(value: &[u8]) -> Vec<(u8, Vec<u8>)> {
    fn read_len(data: &[u8], pos: &mut usize) -> Option<usize> {
        let first = *data.get(*pos)?;
        *pos += 1;
        if first & 0x80 == 0 {
            return Some(first as usize);
        }
        let n = (first & 0x7F) as usize;
        let mut len = 0usize;
        for _ in 0..n {
            len = (len << 8) | *data.get(*pos)? as usize;
            *pos += 1;
        }
        Some(len)
    }
    let mut out = Vec::new();
    let mut pos = 1;
    let Some(_) = read_len(value, &mut pos) else {
        return out;
    };
    while pos < value.len() {
        let tag = value[pos];
        pos += 1;
        let Some(len) = read_len(value, &mut pos) else {
            break;
        };
        let Some(data) = value.get(pos..pos + len) else {
            break;
        };
        out.push((tag, data.to_vec()));
        pos += len;
    }
    out
}

/// Password Modify rejects new passwords shorter than this.
pub const MIN_PASSWORD_LENGTH: usize = 3;

fn extended(
    req: ExtendedRequest,
    controls: &[Control],
    directory: &Arc<Mutex<Directory>>,
    session: &Session,
) -> (ProtocolOp, Vec<Control>) {
    if req.request_name == PASSWORD_MODIFY_OID && session.bound.is_some() {
        let fields = tagged_fields(req.request_value.as_deref().unwrap_or_default());
        if let Some((_, new)) = fields.iter().find(|(tag, _)| *tag == 0x82) {
            if new.len() < MIN_PASSWORD_LENGTH {
                let reply = extended_response(LdapResult::with_code(0x13, "password is too short"), None);
                let wants_policy = controls::find(controls, controls::PASSWORD_POLICY_OID).is_some();
                let policy = if wants_policy {
                    policy_control(PasswordPolicyInfo {
                        error: Some(PasswordPolicyKind::TooShort),
                        ..Default::default()
                    })
                } else {
                    Vec::new()
                };
                return (reply, policy);
            }
        }
    }
    (extended_op(req, directory, session), Vec::new())
}

fn extended_op(req: ExtendedRequest, directory: &Arc<Mutex<Directory>>, session: &Session) -> ProtocolOp {
    match req.request_name.as_str() {
        WHOAMI_OID => {
            let authz = session.bound.as_ref().map(|dn| format!("dn:{}", dn)).unwrap_or_default();
            extended_response(LdapResult::success(), Some(authz.into_bytes()))
        }
        PASSWORD_MODIFY_OID => {
            let Some(bound) = session.bound.clone() else {
                return extended_response(LdapResult::with_code(0x32, "anonymous password change"), None);
            };
            let fields = tagged_fields(req.request_value.as_deref().unwrap_or_default());
            let field = |tag: u8| {
                fields
                    .iter()
                    .find(|(t, _)| *t == tag)
                    .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
            };
            let user = field(0x80).unwrap_or(bound);
            let mut dir = directory.lock().unwrap();
            let Ok(dn) = DistinguishedName::parse(&user) else {
                return extended_response(LdapResult::with_code(0x22, "invalid DN"), None);
            };
            let Some(entry) = dir.entries.get_mut(&dn) else {
                return extended_response(LdapResult::with_code(0x20, "no such object"), None);
            };
            if let Some(old) = field(0x81) {
                if entry.first("userPassword").as_deref() != Some(old.as_str()) {
                    return extended_response(LdapResult::with_code(0x31, "old password mismatch"), None);
                }
            }
            let (new, generated) = match field(0x82) {
                Some(new) => (new, false),
                None => (GENERATED_PASSWORD.to_string(), true),
            };
            entry.attrs.retain(|(k, _)| !k.eq_ignore_ascii_case("userPassword"));
            entry.attrs.push(("userPassword".to_string(), vec![new.clone().into_bytes()]));
            let value = generated.then(|| {
                let mut writer = BerWriter::new();
                let seq = writer.start_sequence();
                writer.write_tagged_octets(0x80, new.as_bytes());
                writer.end_sequence(seq);
                writer.into_vec()
            });
            extended_response(LdapResult::success(), value)
        }
        other => extended_response(LdapResult::with_code(2, &format!("unsupported extended operation {}", other)), None),
    }
}

/// Give the server a moment to process fire-and-forget requests.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
