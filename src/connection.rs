//! One LDAP session: transport, bind, request dispatch and response
//! correlation.
//!
//! A [`Connection`] is driven by whoever holds `&mut` to it. Requests are
//! stamped with increasing message ids and queued on the transport; replies
//! are demultiplexed into the pending table, so responses may complete out of
//! order. Waiting on a reply is the only suspension point.
//!
//! Lifecycle: `Created -> Opening -> Bound -> Closed`. Only the transport
//! setup, StartTLS and bind run before `Bound`; every other operation on an
//! unbound connection fails with [`LdapError::ClosedConnection`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::controls::{self, ExtendedDn, ManageDsaIt, PagedResults, PasswordPolicyInfo, PasswordPolicyRequest, SdFlags, SortRequest};
use crate::dn::DistinguishedName;
use crate::entry::Entry;
use crate::error::{LdapError, Result, rc};
use crate::ldap_protocol::{
    AddRequest, BerReader, BerWriter, BindAuthentication, BindRequest, BindResponse, CompareRequest, Control,
    DelRequest, ExtendedRequest, ExtendedResponse, LdapMessage, LdapResult, ModifyDNRequest, ModifyRequest,
    ProtocolOp, SearchRequest, encode_ldap_message, hex_preview, parse_ldap_message,
};
use crate::logging;
use crate::sasl::{Mechanism, SaslDriver};
use crate::search::{ReferralPolicy, SearchItem, SearchParams, SearchResult, SearchScope, VlvParams};
use crate::transport::Transport;
use crate::url::{LdapUrl, Scheme};
use crate::value_list::AttrValue;

pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
pub const PASSWORD_MODIFY_OID: &str = "1.3.6.1.4.1.4203.1.11.1";
/// Unsolicited notice of disconnection (RFC 4511 §4.4.1).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// How long replies to abandoned requests are silently discarded.
const TOMBSTONE_TTL: Duration = Duration::from_secs(30);
const MAX_REFERRAL_HOPS: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Opening,
    Bound,
    Closed,
}

/// Handle for an outstanding request. Dropping it before the reply has been
/// consumed abandons the request on the wire.
#[derive(Debug)]
pub struct OpHandle {
    msg_id: i32,
    abandon_tx: mpsc::UnboundedSender<i32>,
    finished: bool,
}

impl OpHandle {
    pub fn msg_id(&self) -> i32 {
        self.msg_id
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for OpHandle {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.abandon_tx.send(self.msg_id);
        }
    }
}

/// The terminal reply to a request, with any search results received before it.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub message_id: i32,
    pub op: ProtocolOp,
    pub controls: Vec<Control>,
    pub items: Vec<ProtocolOp>,
}

impl Response {
    pub fn result(&self) -> Option<&LdapResult> {
        result_of(&self.op)
    }

    /// Map a non-success result code to its error.
    pub fn check(&self) -> Result<()> {
        match self.result() {
            Some(result) => check_result(result),
            None => Err(LdapError::Protocol(format!("{} carries no result", self.op.name()))),
        }
    }
}

fn result_of(op: &ProtocolOp) -> Option<&LdapResult> {
    match op {
        ProtocolOp::BindResponse(r) => Some(&r.result),
        ProtocolOp::SearchResultDone(r)
        | ProtocolOp::ModifyResponse(r)
        | ProtocolOp::AddResponse(r)
        | ProtocolOp::DelResponse(r)
        | ProtocolOp::ModifyDNResponse(r)
        | ProtocolOp::CompareResponse(r) => Some(r),
        ProtocolOp::ExtendedResponse(r) => Some(&r.result),
        _ => None,
    }
}

fn check_result(result: &LdapResult) -> Result<()> {
    if result.result_code == rc::SUCCESS {
        Ok(())
    } else {
        Err(LdapError::from_result_code(
            result.result_code,
            &result.diagnostic_message,
            &result.referrals,
        ))
    }
}

fn is_terminal(op: &ProtocolOp) -> bool {
    !matches!(
        op,
        ProtocolOp::SearchResultEntry(_) | ProtocolOp::SearchResultReference(_) | ProtocolOp::IntermediateResponse(_)
    )
}

#[derive(Debug)]
struct PendingOp {
    op: &'static str,
    items: VecDeque<ProtocolOp>,
    done: Option<(ProtocolOp, Vec<Control>)>,
}

/// Progress of a search on the wire.
enum SearchEvent {
    Item(ProtocolOp),
    Done(LdapResult, Vec<Control>),
}

pub struct Connection {
    client: Client,
    url: LdapUrl,
    transport: Option<Transport>,
    state: ConnectionState,
    next_msg_id: i32,
    pending: HashMap<i32, PendingOp>,
    tombstones: HashMap<i32, Instant>,
    abandon_tx: mpsc::UnboundedSender<i32>,
    abandon_rx: mpsc::UnboundedReceiver<i32>,
    password_policy: Option<PasswordPolicyInfo>,
    referral_hops: u8,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url.to_string())
            .field("state", &self.state)
            .field("transport", &self.transport)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Connection {
    /// A connection in the `Created` state; nothing is sent until `open`.
    pub fn new(client: &Client) -> Self {
        let (abandon_tx, abandon_rx) = mpsc::unbounded_channel();
        Self {
            client: client.clone(),
            url: client.url().clone(),
            transport: None,
            state: ConnectionState::Created,
            next_msg_id: 1,
            pending: HashMap::new(),
            tombstones: HashMap::new(),
            abandon_tx,
            abandon_rx,
            password_policy: None,
            referral_hops: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn is_bound(&self) -> bool {
        self.state == ConnectionState::Bound
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn url(&self) -> &LdapUrl {
        &self.url
    }

    pub fn is_tls(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_tls)
    }

    /// Password policy information returned with the last bind.
    pub fn password_policy(&self) -> Option<&PasswordPolicyInfo> {
        self.password_policy.as_ref()
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[cfg(unix)]
    pub fn as_raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.transport.as_ref().and_then(Transport::as_raw_fd)
    }

    /// Establish the transport, optionally upgrade with StartTLS, then bind.
    pub async fn open(&mut self, timeout: Option<Duration>) -> Result<Option<PasswordPolicyInfo>> {
        let timeout = timeout.or(self.client.timeout());
        self.connect_transport(timeout).await?;
        let result = async {
            if self.client.tls() && self.url.scheme() == Scheme::Ldap {
                self.start_tls(timeout).await?;
            }
            self.bind(timeout).await
        }
        .await;
        if let Err(err) = &result {
            debug!("Opening {} failed: {}", self.url, err);
            self.abort();
        }
        result
    }

    /// `Created -> Opening`: connect the transport only.
    pub async fn connect_transport(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.state != ConnectionState::Created {
            return Err(LdapError::InvalidArgument(format!(
                "cannot open a connection in state {:?}",
                self.state
            )));
        }
        self.state = ConnectionState::Opening;
        let tls_config = match self.url.scheme() {
            Scheme::Ldaps => Some(self.client.tls_config()?),
            _ => None,
        };
        match Transport::connect(&self.url, tls_config, timeout).await {
            Ok(transport) => {
                self.transport = Some(transport);
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Closed;
                Err(err)
            }
        }
    }

    /// Upgrade a plain connection with the StartTLS extended operation.
    /// Accepted only before the bind.
    pub async fn start_tls(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.state != ConnectionState::Opening {
            return Err(LdapError::InvalidArgument(
                "StartTLS is only accepted before the bind".to_string(),
            ));
        }
        if self.is_tls() {
            return Err(LdapError::InvalidArgument("TLS is already active".to_string()));
        }
        let config = self.client.tls_config()?;
        let request = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: START_TLS_OID.to_string(),
            request_value: None,
        });
        let handle = self.send(request, Vec::new()).await?;
        self.wait(handle, timeout).await?.check()?;
        let host = self.url.host().to_string();
        let transport = self.transport.as_mut().ok_or(LdapError::ClosedConnection)?;
        if let Err(err) = transport.start_tls(config, &host).await {
            self.abort();
            return Err(err);
        }
        Ok(())
    }

    /// `Opening -> Bound`: authenticate with the client's mechanism. Returns
    /// the password policy response when the policy control is enabled.
    pub async fn bind(&mut self, timeout: Option<Duration>) -> Result<Option<PasswordPolicyInfo>> {
        if self.state != ConnectionState::Opening {
            return Err(LdapError::ClosedConnection);
        }
        let mechanism = self.client.mechanism();
        let credentials = self.client.credentials().clone();
        let controls: Vec<Control> = if self.client.password_policy() {
            vec![PasswordPolicyRequest.into()]
        } else {
            Vec::new()
        };

        let response = if mechanism == Mechanism::Simple {
            self.client.security_properties().check(mechanism, &credentials)?;
            let request = BindRequest {
                version: 3,
                name: credentials.user.clone().unwrap_or_default(),
                authentication: BindAuthentication::Simple(
                    credentials.password.clone().unwrap_or_default().into_bytes(),
                ),
            };
            let handle = self.send(ProtocolOp::BindRequest(request), controls).await?;
            self.wait(handle, timeout).await?
        } else {
            let host = self.url.host().to_string();
            let mut driver = SaslDriver::new(mechanism, &credentials, self.client.security_properties(), &host)?;
            let mut client_creds = driver.initial_response()?;
            loop {
                let request = BindRequest {
                    version: 3,
                    name: String::new(),
                    authentication: BindAuthentication::Sasl {
                        mechanism: mechanism.wire_name().to_string(),
                        credentials: client_creds.take(),
                    },
                };
                let handle = self.send(ProtocolOp::BindRequest(request), controls.clone()).await?;
                let response = self.wait(handle, timeout).await?;
                let ProtocolOp::BindResponse(BindResponse { result, server_sasl_creds }) = &response.op else {
                    return Err(LdapError::Protocol(format!("expected BindResponse, got {}", response.op.name())));
                };
                match result.result_code {
                    rc::SASL_BIND_IN_PROGRESS => {
                        let challenge = server_sasl_creds.as_deref().unwrap_or_default();
                        client_creds = Some(driver.step(challenge)?);
                    }
                    rc::SUCCESS => {
                        driver.finish(server_sasl_creds.as_deref())?;
                        break response;
                    }
                    _ => break response,
                }
            }
        };

        let policy = match controls::find(&response.controls, controls::PASSWORD_POLICY_OID) {
            Some(control) if self.client.password_policy() => Some(
                PasswordPolicyInfo::parse(control.value.as_deref())
                    .map_err(|e| LdapError::Protocol(format!("password policy control: {:#}", e)))?,
            ),
            _ => None,
        };
        let result = response
            .result()
            .ok_or_else(|| LdapError::Protocol("bind reply carries no result".to_string()))?;

        if result.result_code != rc::SUCCESS {
            let err = match policy.as_ref().and_then(|p| p.error) {
                Some(kind) => LdapError::password_policy(kind, &result.diagnostic_message),
                None => LdapError::from_result_code(result.result_code, &result.diagnostic_message, &result.referrals),
            };
            info!("Bind to {} as {:?} failed: {}", self.url, credentials.user, err);
            return Err(err);
        }
        self.state = ConnectionState::Bound;
        info!("Bound to {} with {}", self.url, mechanism);
        if let Some(info) = &policy {
            debug!("Password policy: expire={:?} grace={:?}", info.expire, info.grace);
        }
        self.password_policy = policy.clone();
        Ok(policy)
    }

    /// Unbind and close. Outstanding requests are dropped.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let unbind = self.encode_next(ProtocolOp::UnbindRequest, Vec::new());
        if let Some(transport) = self.transport.as_mut() {
            if let Ok(pdu) = unbind {
                transport.queue(&pdu);
                let _ = transport.flush().await;
            }
            transport.close().await;
        }
        self.transport = None;
        self.pending.clear();
        self.tombstones.clear();
        self.state = ConnectionState::Closed;
        debug!("Closed connection to {}", self.url);
    }

    /// Drop the transport without an unbind.
    fn abort(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.abort();
        }
        self.transport = None;
        self.pending.clear();
        self.state = ConnectionState::Closed;
    }

    fn fail(&mut self, err: LdapError) -> LdapError {
        warn!("Connection to {} failed: {}", self.url, err);
        self.abort();
        err
    }

    fn require_bound(&self) -> Result<()> {
        if self.state == ConnectionState::Bound {
            Ok(())
        } else {
            Err(LdapError::ClosedConnection)
        }
    }

    fn next_id(&mut self) -> Result<i32> {
        if self.next_msg_id == i32::MAX {
            return Err(LdapError::Protocol("message id space exhausted".to_string()));
        }
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        Ok(id)
    }

    fn encode_next(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<Vec<u8>> {
        let message_id = self.next_id()?;
        let name = op.name();
        let message = LdapMessage {
            message_id,
            protocol_op: op,
            controls: if controls.is_empty() { None } else { Some(controls) },
        };
        let pdu = encode_ldap_message(&message).map_err(|e| LdapError::Protocol(format!("{:#}", e)))?;
        if logging::is_debug() {
            debug!("send #{} {}: {}", message_id, name, hex_preview(&pdu));
        }
        Ok(pdu)
    }

    /// Emit AbandonRequests for handles dropped since the last write.
    fn drain_abandoned(&mut self) -> Result<()> {
        while let Ok(msg_id) = self.abandon_rx.try_recv() {
            if let Some(op) = self.pending.remove(&msg_id) {
                if op.done.is_none() {
                    self.queue_abandon(msg_id)?;
                }
            }
        }
        Ok(())
    }

    fn queue_abandon(&mut self, msg_id: i32) -> Result<()> {
        debug!("Abandoning #{}", msg_id);
        let pdu = self.encode_next(ProtocolOp::AbandonRequest(msg_id), Vec::new())?;
        self.transport.as_mut().ok_or(LdapError::ClosedConnection)?.queue(&pdu);
        let now = Instant::now();
        self.tombstones.retain(|_, at| now.duration_since(*at) < TOMBSTONE_TTL);
        self.tombstones.insert(msg_id, now);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let transport = self.transport.as_mut().ok_or(LdapError::ClosedConnection)?;
        if let Err(err) = transport.flush().await {
            return Err(self.fail(err));
        }
        Ok(())
    }

    /// Queue and flush one request. Only bind and StartTLS go out before
    /// the connection is bound.
    async fn send(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<OpHandle> {
        match (&op, self.state) {
            (_, ConnectionState::Bound) => {}
            (ProtocolOp::BindRequest(_), ConnectionState::Opening) => {}
            (ProtocolOp::ExtendedRequest(req), ConnectionState::Opening) if req.request_name == START_TLS_OID => {}
            _ => return Err(LdapError::ClosedConnection),
        }
        self.drain_abandoned()?;
        let kind = op.name();
        let msg_id = self.next_msg_id;
        let pdu = self.encode_next(op, controls)?;
        self.transport.as_mut().ok_or(LdapError::ClosedConnection)?.queue(&pdu);
        self.pending.insert(
            msg_id,
            PendingOp {
                op: kind,
                items: VecDeque::new(),
                done: None,
            },
        );
        debug!("Dispatched {} #{}", kind, msg_id);
        if let Err(err) = self.flush().await {
            self.pending.remove(&msg_id);
            return Err(err);
        }
        Ok(OpHandle {
            msg_id,
            abandon_tx: self.abandon_tx.clone(),
            finished: false,
        })
    }

    /// Send a request and return a handle to poll or wait on.
    pub async fn submit(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<OpHandle> {
        self.require_bound()?;
        self.send(op, controls).await
    }

    /// Read and route one PDU, giving up at `deadline`.
    async fn read_one(&mut self, deadline: Option<Instant>) -> Result<()> {
        let transport = self.transport.as_mut().ok_or(LdapError::ClosedConnection)?;
        let read = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline.into(), transport.read_pdu()).await {
                Ok(read) => read,
                Err(_) => return Err(LdapError::Timeout("no response before the deadline".to_string())),
            },
            None => transport.read_pdu().await,
        };
        let pdu = read.map_err(|e| self.fail(e))?;
        let message = parse_ldap_message(&pdu).map_err(|e| self.fail(LdapError::Protocol(format!("{:#}", e))))?;
        if logging::is_debug() {
            debug!("recv #{} {}: {}", message.message_id, message.protocol_op.name(), hex_preview(&pdu));
        }
        self.dispatch(message)
    }

    fn dispatch(&mut self, message: LdapMessage) -> Result<()> {
        let LdapMessage {
            message_id,
            protocol_op,
            controls,
        } = message;
        if message_id == 0 {
            if let ProtocolOp::ExtendedResponse(resp) = &protocol_op {
                let text = if resp.result.diagnostic_message.is_empty() {
                    "notice of disconnection".to_string()
                } else {
                    resp.result.diagnostic_message.clone()
                };
                return Err(self.fail(LdapError::ConnectionDown(text)));
            }
            return Err(LdapError::InvalidMessageId(0));
        }
        if self.tombstones.contains_key(&message_id) {
            if is_terminal(&protocol_op) {
                self.tombstones.remove(&message_id);
            }
            debug!("Discarding {} for abandoned #{}", protocol_op.name(), message_id);
            return Ok(());
        }
        let Some(pending) = self.pending.get_mut(&message_id) else {
            return Err(LdapError::InvalidMessageId(message_id));
        };
        if is_terminal(&protocol_op) {
            debug!("Completed {} #{}", pending.op, message_id);
            pending.done = Some((protocol_op, controls.unwrap_or_default()));
        } else {
            pending.items.push_back(protocol_op);
        }
        Ok(())
    }

    fn take_response(&mut self, msg_id: i32) -> Option<Response> {
        if self.pending.get(&msg_id)?.done.is_none() {
            return None;
        }
        let pending = self.pending.remove(&msg_id)?;
        let (op, controls) = pending.done?;
        Some(Response {
            message_id: msg_id,
            op,
            controls,
            items: pending.items.into(),
        })
    }

    fn check_handle(&self, handle: &OpHandle) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(LdapError::ClosedConnection);
        }
        if !self.pending.contains_key(&handle.msg_id) {
            return Err(LdapError::InvalidMessageId(handle.msg_id));
        }
        Ok(())
    }

    /// Wait for the reply to `handle`. On timeout the request is abandoned.
    pub async fn wait(&mut self, mut handle: OpHandle, timeout: Option<Duration>) -> Result<Response> {
        self.check_handle(&handle)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(response) = self.take_response(handle.msg_id) {
                handle.finish();
                return Ok(response);
            }
            match self.read_one(deadline).await {
                Ok(()) => {}
                Err(LdapError::Timeout(_)) => {
                    handle.finish();
                    self.abandon_expired(handle.msg_id).await?;
                    return Err(LdapError::Timeout(format!(
                        "request #{} timed out and was abandoned",
                        handle.msg_id
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Non-blocking check for the reply to `handle`: route whatever PDUs are
    /// already readable and return the reply if it has arrived.
    pub async fn poll(&mut self, handle: &mut OpHandle) -> Result<Option<Response>> {
        self.check_handle(handle)?;
        loop {
            if let Some(response) = self.take_response(handle.msg_id) {
                handle.finish();
                return Ok(Some(response));
            }
            match self.read_one(Some(Instant::now())).await {
                Ok(()) => {}
                Err(LdapError::Timeout(_)) => return Ok(None),
                Err(err) => return Err(err),
            }
        }
    }

    /// Forget a request locally and tell the server to stop working on it.
    pub async fn abandon(&mut self, msg_id: i32) -> Result<()> {
        self.require_bound()?;
        if self.pending.remove(&msg_id).is_none() {
            return Err(LdapError::InvalidMessageId(msg_id));
        }
        self.queue_abandon(msg_id)?;
        self.flush().await
    }

    /// Abandon a request whose wait ran out. Also used during the bind.
    async fn abandon_expired(&mut self, msg_id: i32) -> Result<()> {
        self.pending.remove(&msg_id);
        self.queue_abandon(msg_id)?;
        self.flush().await
    }

    async fn next_search_event(&mut self, handle: &mut OpHandle, deadline: Option<Instant>) -> Result<SearchEvent> {
        self.check_handle(handle)?;
        loop {
            if let Some(pending) = self.pending.get_mut(&handle.msg_id) {
                if let Some(item) = pending.items.pop_front() {
                    return Ok(SearchEvent::Item(item));
                }
            }
            if let Some(response) = self.take_response(handle.msg_id) {
                handle.finish();
                return match response.op {
                    ProtocolOp::SearchResultDone(result) => Ok(SearchEvent::Done(result, response.controls)),
                    other => Err(LdapError::Protocol(format!("unexpected {} in a search", other.name()))),
                };
            }
            match self.read_one(deadline).await {
                Ok(()) => {}
                Err(LdapError::Timeout(_)) => {
                    handle.finish();
                    self.abandon_expired(handle.msg_id).await?;
                    return Err(LdapError::Timeout(format!("search #{} timed out and was abandoned", handle.msg_id)));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn with_manage_dsa_it(&self, mut controls: Vec<Control>) -> Vec<Control> {
        if self.client.managedsait() {
            controls.push(ManageDsaIt.into());
        }
        controls
    }

    /// Attach the password policy request when the client asks for it.
    fn with_password_policy(&self, mut controls: Vec<Control>) -> Vec<Control> {
        if self.client.password_policy() {
            controls.push(PasswordPolicyRequest.into());
        }
        controls
    }

    /// Like [`Response::check`], but a password policy error in the response
    /// controls takes precedence over the bare result code.
    fn check_with_policy(&self, response: &Response) -> Result<()> {
        let Some(result) = response.result() else {
            return response.check();
        };
        if result.result_code == rc::SUCCESS {
            return Ok(());
        }
        if self.client.password_policy() {
            if let Some(control) = controls::find(&response.controls, controls::PASSWORD_POLICY_OID) {
                match PasswordPolicyInfo::parse(control.value.as_deref()) {
                    Ok(PasswordPolicyInfo { error: Some(kind), .. }) => {
                        return Err(LdapError::password_policy(kind, &result.diagnostic_message));
                    }
                    Ok(_) => {}
                    Err(err) => debug!("Ignoring malformed password policy control: {:#}", err),
                }
            }
        }
        check_result(result)
    }

    fn search_controls(&self) -> Vec<Control> {
        let mut controls = self.with_manage_dsa_it(Vec::new());
        if let Some(format) = self.client.extended_dn_format() {
            controls.push(ExtendedDn(format).into());
        }
        if let Some(flags) = self.client.sd_flags() {
            controls.push(SdFlags(flags).into());
        }
        controls
    }

    async fn simple_request(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<Response> {
        let handle = self.submit(op, controls).await?;
        let timeout = self.client.timeout();
        self.wait(handle, timeout).await
    }

    pub async fn add(&mut self, entry: &mut Entry) -> Result<()> {
        let request = ProtocolOp::AddRequest(AddRequest {
            entry: entry.dn().to_string(),
            attributes: entry.to_attributes(),
        });
        let controls = self.with_manage_dsa_it(Vec::new());
        self.simple_request(request, controls).await?.check()?;
        entry.clear_changes();
        Ok(())
    }

    /// Delete `dn`. With `recursive`, a non-leaf entry has its subtree
    /// removed first.
    pub async fn delete(&mut self, dn: &str, recursive: bool) -> Result<()> {
        let dn = DistinguishedName::parse(dn)?.to_string();
        if recursive {
            self.delete_tree(dn).await
        } else {
            self.delete_one(&dn).await
        }
    }

    async fn delete_one(&mut self, dn: &str) -> Result<()> {
        let request = ProtocolOp::DelRequest(DelRequest { entry: dn.to_string() });
        let controls = self.with_manage_dsa_it(Vec::new());
        self.simple_request(request, controls).await?.check()
    }

    fn delete_tree(&mut self, dn: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            match self.delete_one(&dn).await {
                Err(LdapError::NotAllowedOnNonleaf(_)) => {
                    debug!("{} has children, deleting them first", dn);
                    let params = SearchParams::new(&dn, SearchScope::SingleLevel, "(objectClass=*)").attrs(["1.1"]);
                    let children: Vec<String> = self
                        .search(&params)
                        .await?
                        .entries()
                        .map(|e| e.dn().to_string())
                        .collect();
                    for child in children {
                        self.delete_tree(child).await?;
                    }
                    self.delete_one(&dn).await
                }
                other => other,
            }
        })
    }

    /// Send the entry's pending changes as one Modify request. The change
    /// markers are reset only when the server accepts it.
    pub async fn modify(&mut self, entry: &mut Entry) -> Result<()> {
        let changes = entry.modify_changes();
        if changes.is_empty() {
            debug!("No changes to send for {}", entry.dn());
            return Ok(());
        }
        let request = ProtocolOp::ModifyRequest(ModifyRequest {
            object: entry.dn().to_string(),
            changes,
        });
        let controls = self.with_password_policy(self.with_manage_dsa_it(Vec::new()));
        let response = self.simple_request(request, controls).await?;
        self.check_with_policy(&response)?;
        entry.clear_changes();
        Ok(())
    }

    pub async fn rename(&mut self, dn: &str, new_dn: &str, delete_old_rdn: bool) -> Result<()> {
        let old = DistinguishedName::parse(dn)?;
        let new = DistinguishedName::parse(new_dn)?;
        let newrdn = new
            .rdn(0)
            .ok_or_else(|| LdapError::InvalidDn(format!("cannot rename to the root DN: {}", new_dn)))?;
        let new_parent = new.parent().unwrap_or_else(DistinguishedName::root);
        let new_superior = match old.parent() {
            Some(parent) if parent == new_parent => None,
            _ => Some(new_parent.to_string()),
        };
        let request = ProtocolOp::ModifyDNRequest(ModifyDNRequest {
            entry: old.to_string(),
            newrdn,
            delete_old_rdn,
            new_superior,
        });
        let controls = self.with_manage_dsa_it(Vec::new());
        self.simple_request(request, controls).await?.check()
    }

    pub async fn compare(&mut self, dn: &str, attr: &str, value: impl Into<AttrValue>) -> Result<bool> {
        let request = ProtocolOp::CompareRequest(CompareRequest {
            entry: DistinguishedName::parse(dn)?.to_string(),
            attr: attr.to_string(),
            assertion_value: value.into().into_bytes(),
        });
        let controls = self.with_manage_dsa_it(Vec::new());
        let response = self.simple_request(request, controls).await?;
        let result = response
            .result()
            .ok_or_else(|| LdapError::Protocol("compare reply carries no result".to_string()))?;
        match result.result_code {
            rc::COMPARE_TRUE => Ok(true),
            rc::COMPARE_FALSE => Ok(false),
            _ => check_result(result).map(|_| false),
        }
    }

    /// Start a search and return the lazy result sequence.
    pub async fn search_stream(&mut self, params: &SearchParams) -> Result<SearchStream<'_>> {
        let request = params.to_request()?;
        let controls = self.search_controls();
        SearchStream::start(self, request, controls, None, params.timeout).await
    }

    /// Run a search to completion.
    pub async fn search(&mut self, params: &SearchParams) -> Result<SearchResult> {
        self.search_stream(params).await?.collect().await
    }

    /// Paged search. Without `auto_page_acquire` each page ends the sequence
    /// until [`SearchStream::acquire_next_page`] is called.
    pub async fn paged_search(&mut self, params: &SearchParams, page_size: i32) -> Result<SearchStream<'_>> {
        if page_size <= 0 {
            return Err(LdapError::InvalidArgument(format!("page size must be positive: {}", page_size)));
        }
        let request = params.to_request()?;
        let controls = self.search_controls();
        SearchStream::start(self, request, controls, Some(page_size), params.timeout).await
    }

    /// Sorted, windowed search. The VLV response control is available
    /// through [`SearchResult::vlv_result`].
    pub async fn virtual_list_search(&mut self, params: &SearchParams, vlv: &VlvParams) -> Result<SearchResult> {
        let request = params.to_request()?;
        let mut controls = self.search_controls();
        if !vlv.sort_order.is_empty() {
            controls.push(
                SortRequest {
                    keys: vlv.sort_order.clone(),
                }
                .into(),
            );
        }
        controls.push(vlv.to_control()?.into());
        SearchStream::start(self, request, controls, None, params.timeout)
            .await?
            .collect()
            .await
    }

    /// Generic extended operation.
    pub async fn extended(&mut self, oid: &str, value: Option<&[u8]>) -> Result<ExtendedResponse> {
        self.extended_with_controls(oid, value, Vec::new()).await
    }

    async fn extended_with_controls(
        &mut self,
        oid: &str,
        value: Option<&[u8]>,
        controls: Vec<Control>,
    ) -> Result<ExtendedResponse> {
        let request = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: oid.to_string(),
            request_value: value.map(<[u8]>::to_vec),
        });
        let response = self.simple_request(request, controls).await?;
        self.check_with_policy(&response)?;
        match response.op {
            ProtocolOp::ExtendedResponse(resp) => Ok(resp),
            other => Err(LdapError::Protocol(format!("expected ExtendedResponse, got {}", other.name()))),
        }
    }

    /// Authorization identity of the session: `dn:...`, `u:...`, or empty
    /// for anonymous.
    pub async fn whoami(&mut self) -> Result<String> {
        let response = self.extended(WHOAMI_OID, None).await?;
        let value = response.response_value.unwrap_or_default();
        String::from_utf8(value).map_err(|_| LdapError::Protocol("Who Am I response is not UTF-8".to_string()))
    }

    /// RFC 3062 password change. Returns the server-generated password when
    /// no new password was supplied.
    pub async fn modify_password(
        &mut self,
        user: Option<&str>,
        new_password: Option<&str>,
        old_password: Option<&str>,
    ) -> Result<Option<String>> {
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        if let Some(user) = user {
            writer.write_tagged_octets(0x80, user.as_bytes());
        }
        if let Some(old) = old_password {
            writer.write_tagged_octets(0x81, old.as_bytes());
        }
        if let Some(new) = new_password {
            writer.write_tagged_octets(0x82, new.as_bytes());
        }
        writer.end_sequence(seq);
        let value = writer.into_vec();
        let controls = self.with_password_policy(Vec::new());
        let response = self
            .extended_with_controls(PASSWORD_MODIFY_OID, Some(&value), controls)
            .await?;
        match response.response_value {
            Some(bytes) if !bytes.is_empty() => parse_generated_password(&bytes),
            _ => Ok(None),
        }
    }
}

fn parse_generated_password(value: &[u8]) -> Result<Option<String>> {
    let parse = || -> anyhow::Result<Option<String>> {
        let mut outer = BerReader::new(value);
        let mut seq = outer.read_sequence()?;
        if seq.remaining() == 0 {
            return Ok(None);
        }
        match seq.read_tag()? {
            0x80 => Ok(Some(seq.read_string_value()?)),
            tag => anyhow::bail!("unexpected tag 0x{:02X} in password modify response", tag),
        }
    };
    parse().map_err(|e| LdapError::Protocol(format!("{:#}", e)))
}

/// Lazy, finite, non-restartable sequence of search results.
///
/// Items are pulled with [`next`](SearchStream::next). For paged searches the
/// sequence pauses at each page boundary unless the client enables
/// `auto_page_acquire`; [`acquire_next_page`](SearchStream::acquire_next_page)
/// requests the next page explicitly.
pub struct SearchStream<'a> {
    conn: &'a mut Connection,
    request: SearchRequest,
    controls: Vec<Control>,
    page_size: Option<i32>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    handle: Option<OpHandle>,
    cookie: Option<Vec<u8>>,
    done_controls: Vec<Control>,
    chased: VecDeque<SearchItem>,
    auto_page: bool,
    policy: ReferralPolicy,
}

impl<'a> SearchStream<'a> {
    async fn start(
        conn: &'a mut Connection,
        request: SearchRequest,
        controls: Vec<Control>,
        page_size: Option<i32>,
        timeout: Option<Duration>,
    ) -> Result<SearchStream<'a>> {
        let timeout = timeout.or(conn.client.timeout());
        let auto_page = conn.client.auto_page_acquire();
        let policy = conn.client.referral_policy();
        let mut stream = SearchStream {
            conn,
            request,
            controls,
            page_size,
            timeout,
            deadline: None,
            handle: None,
            cookie: None,
            done_controls: Vec::new(),
            chased: VecDeque::new(),
            auto_page,
            policy,
        };
        stream.send_page().await?;
        Ok(stream)
    }

    async fn send_page(&mut self) -> Result<i32> {
        let mut controls = self.controls.clone();
        if let Some(size) = self.page_size {
            controls.push(
                PagedResults {
                    size,
                    cookie: self.cookie.clone().unwrap_or_default(),
                }
                .into(),
            );
        }
        let op = ProtocolOp::SearchRequest(self.request.clone());
        let handle = self.conn.submit(op, controls).await?;
        let msg_id = handle.msg_id();
        self.deadline = self.timeout.map(|t| Instant::now() + t);
        self.handle = Some(handle);
        Ok(msg_id)
    }

    /// Message id of the page in flight, if any.
    pub fn msg_id(&self) -> Option<i32> {
        self.handle.as_ref().map(OpHandle::msg_id)
    }

    /// Response controls of the last completed page.
    pub fn response_controls(&self) -> &[Control] {
        &self.done_controls
    }

    /// Ask for the next page. Returns its message id, or `None` once the
    /// server reports no further pages (or the search is not paged).
    pub async fn acquire_next_page(&mut self) -> Result<Option<i32>> {
        if self.page_size.is_none() {
            return Ok(None);
        }
        // Finish the current page first; its items stay queued.
        while self.handle.is_some() {
            if let Some(item) = self.next_event().await? {
                self.chased.push_back(item);
            }
        }
        match &self.cookie {
            Some(cookie) if !cookie.is_empty() => self.send_page().await.map(Some),
            _ => Ok(None),
        }
    }

    /// Next item of the sequence, or `None` at the end (or at a page
    /// boundary for manual paging).
    pub async fn next(&mut self) -> Result<Option<SearchItem>> {
        loop {
            if let Some(item) = self.chased.pop_front() {
                return Ok(Some(item));
            }
            if self.handle.is_none() {
                if self.auto_page && self.acquire_next_page().await?.is_some() {
                    continue;
                }
                return Ok(None);
            }
            if let Some(item) = self.next_event().await? {
                return Ok(Some(item));
            }
        }
    }

    /// Pull one wire event. `Ok(None)` means the page just completed or the
    /// event produced no visible item.
    async fn next_event(&mut self) -> Result<Option<SearchItem>> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(None);
        };
        match self.conn.next_search_event(handle, self.deadline).await {
            Ok(SearchEvent::Item(ProtocolOp::SearchResultEntry(raw))) => {
                let entry = Entry::from_search_entry(raw, self.conn.client.raw_attributes())?;
                Ok(Some(SearchItem::Entry(entry)))
            }
            Ok(SearchEvent::Item(ProtocolOp::SearchResultReference(urls))) => self.on_reference(urls).await,
            Ok(SearchEvent::Item(other)) => {
                debug!("Ignoring {} during search", other.name());
                Ok(None)
            }
            Ok(SearchEvent::Done(result, controls)) => {
                self.handle = None;
                self.cookie = controls::find(&controls, controls::PAGED_RESULTS_OID)
                    .and_then(|c| c.value.as_deref())
                    .and_then(|v| PagedResults::parse(v).ok())
                    .map(|p| p.cookie);
                self.done_controls = controls;
                match result.result_code {
                    rc::SUCCESS => Ok(None),
                    rc::REFERRAL => {
                        if self.policy == ReferralPolicy::ClientSide {
                            let items = self.chase(result.referrals).await;
                            self.chased.extend(items);
                        } else {
                            debug!("Search base is a referral: {:?}", result.referrals);
                        }
                        Ok(None)
                    }
                    code => Err(LdapError::from_result_code(code, &result.diagnostic_message, &result.referrals)),
                }
            }
            Err(err) => {
                self.handle = None;
                Err(err)
            }
        }
    }

    async fn on_reference(&mut self, urls: Vec<String>) -> Result<Option<SearchItem>> {
        match self.policy {
            ReferralPolicy::Yield => Ok(Some(SearchItem::Reference(urls))),
            ReferralPolicy::ServerSide | ReferralPolicy::Drop => {
                debug!("Dropping search reference {:?}", urls);
                Ok(None)
            }
            ReferralPolicy::ClientSide => {
                let items = self.chase(urls).await;
                self.chased.extend(items);
                Ok(None)
            }
        }
    }

    /// Follow referral URLs on fresh connections with the same credentials.
    /// A failing referral is logged and skipped.
    fn chase(&self, urls: Vec<String>) -> impl Future<Output = Vec<SearchItem>> + Send + 'static {
        let client = self.conn.client.clone();
        let request = self.request.clone();
        let hops = self.conn.referral_hops + 1;
        async move {
            if hops > MAX_REFERRAL_HOPS {
                warn!("Referral hop limit reached, skipping {:?}", urls);
                return Vec::new();
            }
            let mut items = Vec::new();
            for url in urls {
                match chase_one(client.clone(), url.clone(), request.clone(), hops).await {
                    Ok(found) => items.extend(found),
                    Err(err) => warn!("Could not follow referral {}: {}", url, err),
                }
            }
            items
        }
    }

    /// Drain the sequence (across pages when auto paging).
    pub async fn collect(mut self) -> Result<SearchResult> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(SearchResult {
            items,
            controls: std::mem::take(&mut self.done_controls),
        })
    }
}

fn chase_one(
    client: Client,
    url: String,
    template: SearchRequest,
    hops: u8,
) -> Pin<Box<dyn Future<Output = Result<Vec<SearchItem>>> + Send>> {
    Box::pin(async move {
        let target = LdapUrl::parse(&url)?;
        let mut params = SearchParams {
            base: template.base_object.clone(),
            scope: Some(template.scope),
            filter: template.filter.to_ldap_string(),
            attrlist: template.attributes.clone(),
            attrsonly: template.types_only,
            sizelimit: template.size_limit,
            ..Default::default()
        };
        if !target.base_dn().is_empty() {
            params.base = target.base_dn().to_string();
        }
        if let Some(scope) = target.scope() {
            params.scope = Some(scope);
        }
        if let Some(filter) = target.filter() {
            params.filter = filter.to_string();
        }
        info!("Following referral to {}", target);
        let referred = client.with_url(target);
        let mut conn = Connection::new(&referred);
        conn.referral_hops = hops;
        conn.open(None).await?;
        let result = conn.search(&params).await;
        conn.close().await;
        Ok(result?.items)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientBuilder;
    use crate::ldap_protocol::SearchResultEntry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn read_message(stream: &mut tokio::net::TcpStream, buf: &mut Vec<u8>) -> LdapMessage {
        loop {
            if let Ok(Some(len)) = crate::ldap_protocol::frame_length(buf) {
                let pdu: Vec<u8> = buf.drain(..len).collect();
                return parse_ldap_message(&pdu).unwrap();
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client hung up");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn reply(stream: &mut tokio::net::TcpStream, message_id: i32, op: ProtocolOp) {
        let pdu = encode_ldap_message(&LdapMessage {
            message_id,
            protocol_op: op,
            controls: None,
        })
        .unwrap();
        stream.write_all(&pdu).await.unwrap();
    }

    async fn bound_pair() -> (Connection, tokio::net::TcpStream, Vec<u8>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = ClientBuilder::new(&format!("ldap://127.0.0.1:{}", addr.port()))
            .credentials("cn=admin,dc=bonsai,dc=test", "secret")
            .build()
            .unwrap();
        let mut conn = Connection::new(&client);
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let bind = read_message(&mut stream, &mut buf).await;
            assert!(matches!(bind.protocol_op, ProtocolOp::BindRequest(_)));
            reply(
                &mut stream,
                bind.message_id,
                ProtocolOp::BindResponse(BindResponse {
                    result: LdapResult::success(),
                    server_sasl_creds: None,
                }),
            )
            .await;
            (stream, buf)
        });
        conn.open(None).await.unwrap();
        let (stream, buf) = server.await.unwrap();
        (conn, stream, buf)
    }

    fn entry(dn: &str) -> ProtocolOp {
        ProtocolOp::SearchResultEntry(SearchResultEntry {
            object_name: dn.to_string(),
            attributes: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_unbound_operations_fail_closed() {
        let client = ClientBuilder::new("ldap://127.0.0.1:1").build().unwrap();
        let mut conn = Connection::new(&client);
        assert_eq!(conn.state(), ConnectionState::Created);
        assert!(matches!(conn.whoami().await, Err(LdapError::ClosedConnection)));
        assert!(matches!(conn.delete("cn=x", false).await, Err(LdapError::ClosedConnection)));
        assert!(matches!(conn.abandon(3).await, Err(LdapError::ClosedConnection)));
    }

    #[tokio::test]
    async fn test_out_of_order_completion() {
        let (mut conn, mut server, mut buf) = bound_pair().await;
        let params = SearchParams::new("dc=bonsai,dc=test", SearchScope::BaseObject, "(objectClass=*)");
        let first = conn
            .submit(ProtocolOp::SearchRequest(params.to_request().unwrap()), Vec::new())
            .await
            .unwrap();
        let second = conn
            .submit(ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: WHOAMI_OID.to_string(),
                request_value: None,
            }), Vec::new())
            .await
            .unwrap();
        assert_ne!(first.msg_id(), second.msg_id());
        assert_eq!(conn.pending_count(), 2);

        let a = read_message(&mut server, &mut buf).await;
        let b = read_message(&mut server, &mut buf).await;
        // Answer the second request before the first.
        reply(
            &mut server,
            b.message_id,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::success(),
                response_name: None,
                response_value: Some(b"dn:cn=admin".to_vec()),
            }),
        )
        .await;
        reply(&mut server, a.message_id, entry("dc=bonsai,dc=test")).await;
        reply(&mut server, a.message_id, ProtocolOp::SearchResultDone(LdapResult::success())).await;

        let response = conn.wait(first, None).await.unwrap();
        assert_eq!(response.items.len(), 1);
        let response = conn.wait(second, None).await.unwrap();
        assert!(matches!(response.op, ProtocolOp::ExtendedResponse(_)));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_abandons_request() {
        let (mut conn, mut server, mut buf) = bound_pair().await;
        let handle = conn
            .submit(ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: WHOAMI_OID.to_string(),
                request_value: None,
            }), Vec::new())
            .await
            .unwrap();
        let msg_id = handle.msg_id();
        let err = conn.wait(handle, Some(Duration::from_millis(50))).await.unwrap_err();
        assert!(matches!(err, LdapError::Timeout(_)));
        assert_eq!(conn.pending_count(), 0);

        let _request = read_message(&mut server, &mut buf).await;
        let abandon = read_message(&mut server, &mut buf).await;
        assert_eq!(abandon.protocol_op, ProtocolOp::AbandonRequest(msg_id));

        // A late reply to the abandoned request is discarded quietly.
        reply(
            &mut server,
            msg_id,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::success(),
                response_name: None,
                response_value: None,
            }),
        )
        .await;
        let mut second = conn
            .submit(ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: WHOAMI_OID.to_string(),
                request_value: None,
            }), Vec::new())
            .await
            .unwrap();
        let second_req = read_message(&mut server, &mut buf).await;
        reply(
            &mut server,
            second_req.message_id,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::success(),
                response_name: None,
                response_value: Some(b"u:admin".to_vec()),
            }),
        )
        .await;
        let mut response = None;
        for _ in 0..100 {
            response = conn.poll(&mut second).await.unwrap();
            if response.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(response.is_some());
    }

    #[tokio::test]
    async fn test_dropped_handle_is_abandoned() {
        let (mut conn, mut server, mut buf) = bound_pair().await;
        let handle = conn
            .submit(ProtocolOp::DelRequest(DelRequest {
                entry: "cn=x,dc=bonsai,dc=test".to_string(),
            }), Vec::new())
            .await
            .unwrap();
        let dropped_id = handle.msg_id();
        drop(handle);
        let next = conn
            .submit(ProtocolOp::DelRequest(DelRequest {
                entry: "cn=y,dc=bonsai,dc=test".to_string(),
            }), Vec::new())
            .await
            .unwrap();
        assert_eq!(conn.pending_count(), 1);

        let _first = read_message(&mut server, &mut buf).await;
        let abandon = read_message(&mut server, &mut buf).await;
        assert_eq!(abandon.protocol_op, ProtocolOp::AbandonRequest(dropped_id));
        let second = read_message(&mut server, &mut buf).await;
        assert_eq!(second.message_id, next.msg_id());
    }

    #[tokio::test]
    async fn test_unknown_message_id() {
        let (mut conn, mut server, mut buf) = bound_pair().await;
        let handle = conn
            .submit(ProtocolOp::DelRequest(DelRequest {
                entry: "cn=x,dc=bonsai,dc=test".to_string(),
            }), Vec::new())
            .await
            .unwrap();
        let _req = read_message(&mut server, &mut buf).await;
        reply(&mut server, 999, ProtocolOp::DelResponse(LdapResult::success())).await;
        let err = conn.wait(handle, None).await.unwrap_err();
        assert!(matches!(err, LdapError::InvalidMessageId(999)));
    }

    #[tokio::test]
    async fn test_server_disconnect_closes() {
        let (mut conn, server, _buf) = bound_pair().await;
        drop(server);
        let err = conn.whoami().await.unwrap_err();
        assert!(err.is_transport());
        assert!(conn.is_closed());
        assert!(matches!(conn.whoami().await, Err(LdapError::ClosedConnection)));
    }

    #[tokio::test]
    async fn test_large_result_code_keeps_session() {
        let (mut conn, mut server, mut buf) = bound_pair().await;
        let whoami = || {
            ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: WHOAMI_OID.to_string(),
                request_value: None,
            })
        };
        let handle = conn.submit(whoami(), Vec::new()).await.unwrap();
        let req = read_message(&mut server, &mut buf).await;
        reply(
            &mut server,
            req.message_id,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::with_code(4096, "sync refresh required"),
                response_name: None,
                response_value: None,
            }),
        )
        .await;
        let err = conn.wait(handle, None).await.unwrap().check().unwrap_err();
        assert!(matches!(err, LdapError::Other { code: 4096, .. }));
        assert!(conn.is_bound());

        let handle = conn.submit(whoami(), Vec::new()).await.unwrap();
        let req = read_message(&mut server, &mut buf).await;
        reply(&mut server, req.message_id, ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: LdapResult::success(),
            response_name: None,
            response_value: None,
        }))
        .await;
        assert!(conn.wait(handle, None).await.unwrap().check().is_ok());
    }

    #[test]
    fn test_generated_password_parse() {
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        writer.write_tagged_octets(0x80, b"s3cr3t");
        writer.end_sequence(seq);
        assert_eq!(
            parse_generated_password(&writer.into_vec()).unwrap(),
            Some("s3cr3t".to_string())
        );
        assert!(parse_generated_password(&[0x30, 0x03, 0x81, 0x01, 0x41]).is_err());
    }
}
