// LDAP protocol handling with BER encoding/decoding
// Implements the LDAPv3 PDUs of RFC 4511 in both directions

use anyhow::{Context, Result, bail};
use std::io::{Cursor, Read};

use crate::filter::Filter;

/// Largest PDU the client accepts from the wire.
pub const MAX_PDU_LENGTH: usize = 16 * 1024 * 1024;

// LDAP Control (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub ctype: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

// LDAP Message structure
#[derive(Debug, Clone, PartialEq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    ModifyDNRequest(ModifyDNRequest),
    ModifyDNResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
}

impl ProtocolOp {
    /// Short operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "BIND",
            ProtocolOp::BindResponse(_) => "BIND_RESPONSE",
            ProtocolOp::UnbindRequest => "UNBIND",
            ProtocolOp::SearchRequest(_) => "SEARCH",
            ProtocolOp::SearchResultEntry(_) => "SEARCH_ENTRY",
            ProtocolOp::SearchResultReference(_) => "SEARCH_REFERENCE",
            ProtocolOp::SearchResultDone(_) => "SEARCH_DONE",
            ProtocolOp::ModifyRequest(_) => "MODIFY",
            ProtocolOp::ModifyResponse(_) => "MODIFY_RESPONSE",
            ProtocolOp::AddRequest(_) => "ADD",
            ProtocolOp::AddResponse(_) => "ADD_RESPONSE",
            ProtocolOp::DelRequest(_) => "DELETE",
            ProtocolOp::DelResponse(_) => "DELETE_RESPONSE",
            ProtocolOp::ModifyDNRequest(_) => "MODIFYDN",
            ProtocolOp::ModifyDNResponse(_) => "MODIFYDN_RESPONSE",
            ProtocolOp::CompareRequest(_) => "COMPARE",
            ProtocolOp::CompareResponse(_) => "COMPARE_RESPONSE",
            ProtocolOp::AbandonRequest(_) => "ABANDON",
            ProtocolOp::ExtendedRequest(_) => "EXTENDED",
            ProtocolOp::ExtendedResponse(_) => "EXTENDED_RESPONSE",
            ProtocolOp::IntermediateResponse(_) => "INTERMEDIATE_RESPONSE",
        }
    }
}

/// LDAPResult components shared by every response PDU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_code(result_code: i32, diagnostic_message: &str) -> Self {
        Self {
            result_code,
            diagnostic_message: diagnostic_message.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateResponse {
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(Vec<u8>),
    Sasl { mechanism: String, credentials: Option<Vec<u8>> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<i32> for SearchScope {
    type Error = anyhow::Error;
    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => bail!("Invalid search scope: {}", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDNRequest {
    pub entry: String,
    pub newrdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub assertion_value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

// BER parsing utilities
pub(crate) struct BerReader<'a> {
    pub(crate) cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub(crate) fn read_tag(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf).context("BER truncated: missing tag")?;
        Ok(buf[0])
    }

    /// Look at the next tag without consuming it.
    pub(crate) fn peek_tag(&self) -> Option<u8> {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().get(pos).copied()
    }

    pub(crate) fn read_length(&mut self) -> Result<usize> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf).context("BER truncated: missing length")?;
        let first_byte = buf[0];

        if (first_byte & 0x80) == 0 {
            // Short form
            Ok(first_byte as usize)
        } else {
            // Long form
            let length_bytes = (first_byte & 0x7F) as usize;
            if length_bytes == 0 {
                bail!("Indefinite length not supported");
            }
            if length_bytes > 4 {
                bail!("Length too large: {} bytes", length_bytes);
            }
            if self.remaining() < length_bytes {
                bail!("BER truncated: length encoding needs {} bytes, {} remaining", length_bytes, self.remaining());
            }
            let mut length = 0u32;
            for _ in 0..length_bytes {
                self.cursor.read_exact(&mut buf)?;
                length = (length << 8) | buf[0] as u32;
            }
            Ok(length as usize)
        }
    }

    /// Read the value of an INTEGER whose tag was already consumed.
    pub(crate) fn read_integer_value(&mut self) -> Result<i32> {
        let length = self.read_length()?;
        if length == 0 {
            bail!("Integer with zero length");
        }
        let buf = self.read_raw_bytes(length)?;
        // A leading zero octet may precede four value octets.
        let digits = if length == 5 && buf[0] == 0 { &buf[1..] } else { &buf[..] };
        if digits.len() > 4 {
            bail!("Integer too large: {} bytes", length);
        }

        let mut value = 0i64;
        for &byte in digits {
            value = (value << 8) | byte as i64;
        }
        // Sign extension for negative numbers
        if length <= 4 && (buf[0] & 0x80) != 0 {
            value -= 1i64 << (length * 8);
        }
        i32::try_from(value).context("Integer out of range")
    }

    pub(crate) fn read_integer(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x02 {
            bail!("Expected INTEGER tag (0x02), got: 0x{:02X}", tag);
        }
        self.read_integer_value()
    }

    /// Read OCTET STRING TLV. Accepts 0x04 (universal) or any primitive context-specific tag.
    pub(crate) fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let tag = self.read_tag()?;
        let ok = tag == 0x04 || (0x80..=0x9F).contains(&tag);
        if !ok {
            bail!("Expected OCTET STRING tag (0x04), got: 0x{:02X}", tag);
        }
        self.read_octet_string_value()
    }

    /// Read only length + value of OCTET STRING (tag already consumed). Use after read_tag() for [0] IMPLICIT etc.
    pub(crate) fn read_octet_string_value(&mut self) -> Result<Vec<u8>> {
        let length = self.read_length()?;
        self.read_raw_bytes(length)
    }

    pub(crate) fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).context("Invalid UTF-8 string")
    }

    pub(crate) fn read_string_value(&mut self) -> Result<String> {
        let bytes = self.read_octet_string_value()?;
        String::from_utf8(bytes).context("Invalid UTF-8 string")
    }

    /// Read a constructed TLV with the expected tag and return a reader over its content.
    pub(crate) fn read_constructed(&mut self, expected: u8) -> Result<BerReader<'a>> {
        let tag = self.read_tag()?;
        if tag != expected {
            bail!("Expected tag 0x{:02X}, got: 0x{:02X}", expected, tag);
        }
        self.read_constructed_value()
    }

    /// Content reader for a constructed TLV whose tag was already consumed.
    pub(crate) fn read_constructed_value(&mut self) -> Result<BerReader<'a>> {
        let length = self.read_length()?;
        if self.remaining() < length {
            bail!("BER truncated: constructed value needs {} bytes, {} remaining", length, self.remaining());
        }
        let data: &'a [u8] = self.cursor.get_ref();
        let start = self.cursor.position() as usize;
        self.cursor.set_position((start + length) as u64);
        Ok(BerReader::new(&data[start..start + length]))
    }

    pub(crate) fn read_sequence(&mut self) -> Result<BerReader<'a>> {
        self.read_constructed(0x30)
    }

    pub(crate) fn read_enumerated(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x0A {
            bail!("Expected ENUMERATED tag, got: 0x{:02X}", tag);
        }
        self.read_integer_value()
    }

    pub(crate) fn read_boolean(&mut self) -> Result<bool> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x01 {
            bail!("Expected BOOLEAN tag, got: 0x{:02X}", tag);
        }
        self.read_boolean_value()
    }

    pub(crate) fn read_boolean_value(&mut self) -> Result<bool> {
        let length = self.read_length()?;
        if length != 1 {
            bail!("Boolean value must be 1 byte, got: {}", length);
        }
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0] != 0)
    }

    /// Skip one complete TLV.
    pub(crate) fn skip(&mut self) -> Result<()> {
        let _tag = self.read_tag()?;
        let length = self.read_length()?;
        self.read_raw_bytes(length)?;
        Ok(())
    }

    pub(crate) fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        let len = self.cursor.get_ref().len();
        len.saturating_sub(pos)
    }

    pub(crate) fn read_raw_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.remaining() < n {
            bail!("BER truncated: need {} bytes, {} remaining", n, self.remaining());
        }
        let mut buf = vec![0u8; n];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }
}

// BER encoding utilities
#[derive(Debug, Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
        }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        let encoded = encode_length(length);
        self.buffer.extend_from_slice(&encoded);
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_integer_tagged(0x02, value);
    }

    /// INTEGER content under an arbitrary (implicit) tag, minimal two's complement.
    pub fn write_integer_tagged(&mut self, tag: u8, value: i32) {
        self.write_tag(tag);
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < 3 {
            let b = bytes[start];
            let next_high = bytes[start + 1] & 0x80;
            if (b == 0x00 && next_high == 0) || (b == 0xFF && next_high != 0) {
                start += 1;
            } else {
                break;
            }
        }
        self.write_length(4 - start);
        self.buffer.extend_from_slice(&bytes[start..]);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tagged_octets(0x04, data);
    }

    /// Primitive TLV with the given tag (used for IMPLICIT OCTET STRINGs).
    pub fn write_tagged_octets(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_boolean_tagged(0x01, value);
    }

    pub fn write_boolean_tagged(&mut self, tag: u8, value: bool) {
        self.write_tag(tag);
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    pub fn write_enumerated(&mut self, value: i32) {
        self.write_integer_tagged(0x0A, value);
    }

    /// Write a tag and reserve a length byte; call `end_constructed` after the content.
    pub fn start_constructed(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patch length at pos for content written after the placeholder.
    /// Supports short and long form.
    pub fn end_constructed(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        let encoded = encode_length(content_len);
        self.buffer.splice(pos..pos + 1, encoded);
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start_constructed(0x30)
    }

    pub fn end_sequence(&mut self, start_pos: usize) {
        self.end_constructed(start_pos);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

fn encode_length(length: usize) -> Vec<u8> {
    if length < 128 {
        // Short form
        vec![length as u8]
    } else {
        // Long form
        let mut bytes = Vec::new();
        let mut len = length;
        while len > 0 {
            bytes.push((len & 0xFF) as u8);
            len >>= 8;
        }
        bytes.push(0x80 | bytes.len() as u8);
        bytes.reverse();
        bytes
    }
}

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
/// [APPLICATION 25] intermediate response
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;

/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;
/// LDAPResult referral [3]
const LDAP_CONTEXT_REFERRAL: u8 = 0xA3;
/// BindResponse serverSaslCreds [7]
const LDAP_CONTEXT_SASL_CREDS: u8 = 0x87;

/// Length of the first complete PDU in `buf`, or None when more bytes are needed.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != 0x30 {
        bail!("LDAP message must start with SEQUENCE, got: 0x{:02X}", buf[0]);
    }
    let first_byte = buf[1];
    let total = if (first_byte & 0x80) == 0 {
        2 + first_byte as usize
    } else {
        let length_bytes = (first_byte & 0x7F) as usize;
        if length_bytes == 0 || length_bytes > 4 {
            bail!("Invalid length encoding");
        }
        if buf.len() < 2 + length_bytes {
            return Ok(None);
        }
        let mut length = 0usize;
        for i in 0..length_bytes {
            length = (length << 8) | buf[2 + i] as usize;
        }
        2 + length_bytes + length
    };
    if total > MAX_PDU_LENGTH {
        bail!("LDAP message of {} bytes exceeds the {} byte limit", total, MAX_PDU_LENGTH);
    }
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(total))
}

pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut outer = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let mut reader = outer.read_sequence()?;

    let message_id = reader.read_integer()?;

    let tag = reader.read_tag()?;
    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(parse_bind_response(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_UNBIND_REQUEST => {
            reader.read_octet_string_value()?;
            ProtocolOp::UnbindRequest
        }
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => ProtocolOp::SearchResultEntry(parse_search_result_entry(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_SEARCH_RESULT_REFERENCE => {
            let mut refs = reader.read_constructed_value()?;
            let mut urls = Vec::new();
            while refs.remaining() > 0 {
                urls.push(refs.read_string()?);
            }
            ProtocolOp::SearchResultReference(urls)
        }
        LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(parse_ldap_result(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyRequest(parse_modify_request(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(parse_ldap_result(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_ADD_REQUEST => ProtocolOp::AddRequest(parse_add_request(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(parse_ldap_result(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_DEL_REQUEST => ProtocolOp::DelRequest(DelRequest {
            entry: reader.read_string_value()?,
        }),
        LDAP_TAG_DEL_RESPONSE => ProtocolOp::DelResponse(parse_ldap_result(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_MODIFY_DN_REQUEST => ProtocolOp::ModifyDNRequest(parse_modify_dn_request(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_MODIFY_DN_RESPONSE => ProtocolOp::ModifyDNResponse(parse_ldap_result(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_COMPARE_REQUEST => ProtocolOp::CompareRequest(parse_compare_request(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_COMPARE_RESPONSE => ProtocolOp::CompareResponse(parse_ldap_result(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_ABANDON_REQUEST => ProtocolOp::AbandonRequest(reader.read_integer_value()?),
        LDAP_TAG_EXTENDED_REQUEST => ProtocolOp::ExtendedRequest(parse_extended_request(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_EXTENDED_RESPONSE => ProtocolOp::ExtendedResponse(parse_extended_response(&mut reader.read_constructed_value()?)?),
        LDAP_TAG_INTERMEDIATE_RESPONSE => ProtocolOp::IntermediateResponse(parse_intermediate_response(&mut reader.read_constructed_value()?)?),
        _ => bail!("Unsupported LDAP operation tag: 0x{:02X}", tag),
    };

    let controls = if reader.remaining() > 0 {
        let mut ctrls = reader.read_constructed(LDAP_CONTEXT_CONTROLS)?;
        Some(parse_controls(&mut ctrls)?)
    } else {
        None
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

/// Parse controls: SEQUENCE OF Control, each Control ::= SEQUENCE { type, critical DEFAULT FALSE, value OPTIONAL }
fn parse_controls(reader: &mut BerReader) -> Result<Vec<Control>> {
    let mut controls = Vec::new();
    while reader.remaining() > 0 {
        let mut ctrl = reader.read_sequence()?;
        let ctype = ctrl.read_string()?;
        let mut critical = false;
        let mut value = None;
        while ctrl.remaining() > 0 {
            let tag = ctrl.read_tag()?;
            match tag {
                0x01 => critical = ctrl.read_boolean_value()?,
                0x04 => value = Some(ctrl.read_octet_string_value()?),
                _ => bail!("Unexpected tag in control {}: 0x{:02X}", ctype, tag),
            }
        }
        controls.push(Control {
            ctype,
            critical,
            value,
        });
    }
    Ok(controls)
}

fn parse_ldap_result(reader: &mut BerReader) -> Result<LdapResult> {
    let result_code = reader.read_enumerated()?;
    let matched_dn = reader.read_string()?;
    let diagnostic_message = String::from_utf8_lossy(&reader.read_octet_string()?).to_string();
    let mut referrals = Vec::new();
    if reader.peek_tag() == Some(LDAP_CONTEXT_REFERRAL) {
        let mut refs = reader.read_constructed(LDAP_CONTEXT_REFERRAL)?;
        while refs.remaining() > 0 {
            referrals.push(refs.read_string()?);
        }
    }
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
        referrals,
    })
}

fn parse_bind_request(reader: &mut BerReader) -> Result<BindRequest> {
    let version = reader.read_integer()?;
    let name = reader.read_string()?;

    let auth_tag = reader.read_tag()?;
    let authentication = match auth_tag {
        0x80 => BindAuthentication::Simple(reader.read_octet_string_value()?),
        0xA3 => {
            let mut sasl = reader.read_constructed_value()?;
            let mechanism = sasl.read_string()?;
            let credentials = if sasl.remaining() > 0 {
                Some(sasl.read_octet_string()?)
            } else {
                None
            };
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            }
        }
        _ => bail!("Unsupported bind authentication tag: 0x{:02X}", auth_tag),
    };

    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_bind_response(reader: &mut BerReader) -> Result<BindResponse> {
    let result = parse_ldap_result(reader)?;
    let server_sasl_creds = if reader.peek_tag() == Some(LDAP_CONTEXT_SASL_CREDS) {
        reader.read_tag()?;
        Some(reader.read_octet_string_value()?)
    } else {
        None
    };
    Ok(BindResponse {
        result,
        server_sasl_creds,
    })
}

fn parse_search_request(reader: &mut BerReader) -> Result<SearchRequest> {
    let base_object = reader.read_string()?;
    let scope = SearchScope::try_from(reader.read_enumerated()?)?;
    let deref_aliases = reader.read_enumerated()?;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;
    let filter = Filter::parse_ber(reader)?;

    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while attrs.remaining() > 0 {
        attributes.push(attrs.read_string()?);
    }

    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_search_result_entry(reader: &mut BerReader) -> Result<SearchResultEntry> {
    let object_name = reader.read_string()?;
    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while attrs.remaining() > 0 {
        attributes.push(parse_attribute(&mut attrs)?);
    }
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

fn parse_modify_request(reader: &mut BerReader) -> Result<ModifyRequest> {
    let object = reader.read_string()?;

    let mut changes_seq = reader.read_sequence()?;
    let mut changes = Vec::new();

    while changes_seq.remaining() > 0 {
        let mut change = changes_seq.read_sequence()?;
        let operation = change.read_enumerated()?;
        let modification = parse_attribute(&mut change)?;

        changes.push(ModifyChange {
            operation: match operation {
                0 => ModifyOperation::Add,
                1 => ModifyOperation::Delete,
                2 => ModifyOperation::Replace,
                _ => bail!("Invalid modify operation: {}", operation),
            },
            modification,
        });
    }

    Ok(ModifyRequest {
        object,
        changes,
    })
}

fn parse_add_request(reader: &mut BerReader) -> Result<AddRequest> {
    let entry = reader.read_string()?;

    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while attrs.remaining() > 0 {
        attributes.push(parse_attribute(&mut attrs)?);
    }

    Ok(AddRequest {
        entry,
        attributes,
    })
}

/// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE { entry, newrdn, deleteoldrdn, newSuperior [0] OPTIONAL }
fn parse_modify_dn_request(reader: &mut BerReader) -> Result<ModifyDNRequest> {
    let entry = reader.read_string()?;
    let newrdn = reader.read_string()?;
    let delete_old_rdn = reader.read_boolean()?;
    let new_superior = if reader.remaining() > 0 {
        let tag = reader.read_tag()?;
        if tag == 0x80 {
            Some(reader.read_string_value()?)
        } else {
            bail!("ModifyDNRequest: expected newSuperior [0], got tag 0x{:02X}", tag);
        }
    } else {
        None
    };
    Ok(ModifyDNRequest {
        entry,
        newrdn,
        delete_old_rdn,
        new_superior,
    })
}

/// CompareRequest ::= [APPLICATION 14] SEQUENCE { entry, ava AttributeValueAssertion }
fn parse_compare_request(reader: &mut BerReader) -> Result<CompareRequest> {
    let entry = reader.read_string()?;
    let mut ava = reader.read_sequence()?;
    let attr = ava.read_string()?;
    let assertion_value = ava.read_octet_string()?;
    Ok(CompareRequest {
        entry,
        attr,
        assertion_value,
    })
}

fn parse_extended_request(reader: &mut BerReader) -> Result<ExtendedRequest> {
    let tag = reader.read_tag()?;
    if tag != 0x80 {
        bail!("ExtendedRequest: expected requestName [0], got tag 0x{:02X}", tag);
    }
    let request_name = reader.read_string_value()?;
    let request_value = if reader.remaining() > 0 {
        Some(reader.read_octet_string()?)
    } else {
        None
    };
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

fn parse_extended_response(reader: &mut BerReader) -> Result<ExtendedResponse> {
    let result = parse_ldap_result(reader)?;
    let mut response_name = None;
    let mut response_value = None;
    while reader.remaining() > 0 {
        match reader.read_tag()? {
            0x8A => response_name = Some(reader.read_string_value()?),
            0x8B => response_value = Some(reader.read_octet_string_value()?),
            tag => bail!("ExtendedResponse: unexpected tag 0x{:02X}", tag),
        }
    }
    Ok(ExtendedResponse {
        result,
        response_name,
        response_value,
    })
}

fn parse_intermediate_response(reader: &mut BerReader) -> Result<IntermediateResponse> {
    let mut response_name = None;
    let mut response_value = None;
    while reader.remaining() > 0 {
        match reader.read_tag()? {
            0x80 => response_name = Some(reader.read_string_value()?),
            0x81 => response_value = Some(reader.read_octet_string_value()?),
            tag => bail!("IntermediateResponse: unexpected tag 0x{:02X}", tag),
        }
    }
    Ok(IntermediateResponse {
        response_name,
        response_value,
    })
}

fn parse_attribute(reader: &mut BerReader) -> Result<Attribute> {
    let mut attr = reader.read_sequence()?;
    let attr_type = attr.read_string()?;

    let mut vals = attr.read_constructed(0x31)?;
    let mut attr_values = Vec::new();
    while vals.remaining() > 0 {
        attr_values.push(vals.read_octet_string()?);
    }

    Ok(Attribute {
        attr_type,
        attr_values,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();

    writer.write_integer(message.message_id);

    match &message.protocol_op {
        ProtocolOp::BindRequest(req) => encode_bind_request(&mut writer, req),
        ProtocolOp::BindResponse(resp) => {
            let pos = writer.start_constructed(LDAP_TAG_BIND_RESPONSE);
            encode_ldap_result(&mut writer, &resp.result);
            if let Some(ref creds) = resp.server_sasl_creds {
                writer.write_tagged_octets(LDAP_CONTEXT_SASL_CREDS, creds);
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::UnbindRequest => writer.write_tagged_octets(LDAP_TAG_UNBIND_REQUEST, &[]),
        ProtocolOp::SearchRequest(req) => encode_search_request(&mut writer, req)?,
        ProtocolOp::SearchResultEntry(entry) => {
            let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_ENTRY);
            writer.write_string(&entry.object_name);
            let attrs_start = writer.start_sequence();
            for attr in &entry.attributes {
                encode_attribute(&mut writer, attr);
            }
            writer.end_sequence(attrs_start);
            writer.end_constructed(pos);
        }
        ProtocolOp::SearchResultReference(urls) => {
            let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_REFERENCE);
            for url in urls {
                writer.write_string(url);
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::SearchResultDone(result) => encode_result_op(&mut writer, LDAP_TAG_SEARCH_RESULT_DONE, result),
        ProtocolOp::ModifyRequest(req) => {
            let pos = writer.start_constructed(LDAP_TAG_MODIFY_REQUEST);
            writer.write_string(&req.object);
            let changes = writer.start_sequence();
            for change in &req.changes {
                let c = writer.start_sequence();
                writer.write_enumerated(change.operation as i32);
                encode_attribute(&mut writer, &change.modification);
                writer.end_sequence(c);
            }
            writer.end_sequence(changes);
            writer.end_constructed(pos);
        }
        ProtocolOp::ModifyResponse(result) => encode_result_op(&mut writer, LDAP_TAG_MODIFY_RESPONSE, result),
        ProtocolOp::AddRequest(req) => {
            let pos = writer.start_constructed(LDAP_TAG_ADD_REQUEST);
            writer.write_string(&req.entry);
            let attrs = writer.start_sequence();
            for attr in &req.attributes {
                encode_attribute(&mut writer, attr);
            }
            writer.end_sequence(attrs);
            writer.end_constructed(pos);
        }
        ProtocolOp::AddResponse(result) => encode_result_op(&mut writer, LDAP_TAG_ADD_RESPONSE, result),
        ProtocolOp::DelRequest(req) => writer.write_tagged_octets(LDAP_TAG_DEL_REQUEST, req.entry.as_bytes()),
        ProtocolOp::DelResponse(result) => encode_result_op(&mut writer, LDAP_TAG_DEL_RESPONSE, result),
        ProtocolOp::ModifyDNRequest(req) => {
            let pos = writer.start_constructed(LDAP_TAG_MODIFY_DN_REQUEST);
            writer.write_string(&req.entry);
            writer.write_string(&req.newrdn);
            writer.write_boolean(req.delete_old_rdn);
            if let Some(ref sup) = req.new_superior {
                writer.write_tagged_octets(0x80, sup.as_bytes());
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::ModifyDNResponse(result) => encode_result_op(&mut writer, LDAP_TAG_MODIFY_DN_RESPONSE, result),
        ProtocolOp::CompareRequest(req) => {
            let pos = writer.start_constructed(LDAP_TAG_COMPARE_REQUEST);
            writer.write_string(&req.entry);
            let ava = writer.start_sequence();
            writer.write_string(&req.attr);
            writer.write_octet_string(&req.assertion_value);
            writer.end_sequence(ava);
            writer.end_constructed(pos);
        }
        ProtocolOp::CompareResponse(result) => encode_result_op(&mut writer, LDAP_TAG_COMPARE_RESPONSE, result),
        ProtocolOp::AbandonRequest(id) => writer.write_integer_tagged(LDAP_TAG_ABANDON_REQUEST, *id),
        ProtocolOp::ExtendedRequest(req) => {
            let pos = writer.start_constructed(LDAP_TAG_EXTENDED_REQUEST);
            writer.write_tagged_octets(0x80, req.request_name.as_bytes());
            if let Some(ref value) = req.request_value {
                writer.write_tagged_octets(0x81, value);
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::ExtendedResponse(resp) => {
            let pos = writer.start_constructed(LDAP_TAG_EXTENDED_RESPONSE);
            encode_ldap_result(&mut writer, &resp.result);
            if let Some(ref name) = resp.response_name {
                writer.write_tagged_octets(0x8A, name.as_bytes());
            }
            if let Some(ref value) = resp.response_value {
                writer.write_tagged_octets(0x8B, value);
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::IntermediateResponse(resp) => {
            let pos = writer.start_constructed(LDAP_TAG_INTERMEDIATE_RESPONSE);
            if let Some(ref name) = resp.response_name {
                writer.write_tagged_octets(0x80, name.as_bytes());
            }
            if let Some(ref value) = resp.response_value {
                writer.write_tagged_octets(0x81, value);
            }
            writer.end_constructed(pos);
        }
    }

    if let Some(ref controls) = message.controls {
        encode_controls(&mut writer, controls);
    }

    writer.end_sequence(seq_start);
    Ok(writer.into_vec())
}

fn encode_controls(writer: &mut BerWriter, controls: &[Control]) {
    let pos = writer.start_constructed(LDAP_CONTEXT_CONTROLS);
    for control in controls {
        let c = writer.start_sequence();
        writer.write_string(&control.ctype);
        if control.critical {
            writer.write_boolean(true);
        }
        if let Some(ref value) = control.value {
            writer.write_octet_string(value);
        }
        writer.end_sequence(c);
    }
    writer.end_constructed(pos);
}

fn encode_bind_request(writer: &mut BerWriter, req: &BindRequest) {
    let pos = writer.start_constructed(LDAP_TAG_BIND_REQUEST);
    writer.write_integer(req.version);
    writer.write_string(&req.name);
    match &req.authentication {
        BindAuthentication::Simple(password) => writer.write_tagged_octets(0x80, password),
        BindAuthentication::Sasl { mechanism, credentials } => {
            let sasl = writer.start_constructed(0xA3);
            writer.write_string(mechanism);
            if let Some(creds) = credentials {
                writer.write_octet_string(creds);
            }
            writer.end_constructed(sasl);
        }
    }
    writer.end_constructed(pos);
}

fn encode_search_request(writer: &mut BerWriter, req: &SearchRequest) -> Result<()> {
    let pos = writer.start_constructed(LDAP_TAG_SEARCH_REQUEST);
    writer.write_string(&req.base_object);
    writer.write_enumerated(req.scope as i32);
    if !(0..=3).contains(&req.deref_aliases) {
        bail!("Invalid derefAliases value: {}", req.deref_aliases);
    }
    writer.write_enumerated(req.deref_aliases);
    writer.write_integer(req.size_limit);
    writer.write_integer(req.time_limit);
    writer.write_boolean(req.types_only);
    req.filter.write_ber(writer);
    let attrs = writer.start_sequence();
    for attr in &req.attributes {
        writer.write_string(attr);
    }
    writer.end_sequence(attrs);
    writer.end_constructed(pos);
    Ok(())
}

fn encode_ldap_result(writer: &mut BerWriter, result: &LdapResult) {
    writer.write_enumerated(result.result_code);
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.diagnostic_message);
    if !result.referrals.is_empty() {
        let pos = writer.start_constructed(LDAP_CONTEXT_REFERRAL);
        for url in &result.referrals {
            writer.write_string(url);
        }
        writer.end_constructed(pos);
    }
}

fn encode_result_op(writer: &mut BerWriter, tag: u8, result: &LdapResult) {
    let pos = writer.start_constructed(tag);
    encode_ldap_result(writer, result);
    writer.end_constructed(pos);
}

fn encode_attribute(writer: &mut BerWriter, attr: &Attribute) {
    let seq_start = writer.start_sequence();
    writer.write_string(&attr.attr_type);

    let vals_start = writer.start_constructed(0x31);
    for value in &attr.attr_values {
        writer.write_octet_string(value);
    }
    writer.end_constructed(vals_start);

    writer.end_sequence(seq_start);
}

/// Hex dump of at most the first 64 bytes, for debug traces.
pub fn hex_preview(data: &[u8]) -> String {
    data.iter()
        .take(64)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: LdapMessage) {
        let encoded = encode_ldap_message(&message).unwrap();
        assert_eq!(frame_length(&encoded).unwrap(), Some(encoded.len()));
        let parsed = parse_ldap_message(&encoded).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_search_scope_try_from() {
        assert_eq!(SearchScope::try_from(0).unwrap(), SearchScope::BaseObject);
        assert_eq!(SearchScope::try_from(1).unwrap(), SearchScope::SingleLevel);
        assert_eq!(SearchScope::try_from(2).unwrap(), SearchScope::WholeSubtree);
        assert!(SearchScope::try_from(3).is_err());
        assert!(SearchScope::try_from(255).is_err());
    }

    #[test]
    fn test_ber_writer_integer() {
        let cases: [(i32, &[u8]); 7] = [
            (0, &[0x02, 0x01, 0x00]),
            (127, &[0x02, 0x01, 0x7F]),
            (128, &[0x02, 0x02, 0x00, 0x80]),
            (-128, &[0x02, 0x01, 0x80]),
            (256, &[0x02, 0x02, 0x01, 0x00]),
            (-1, &[0x02, 0x01, 0xFF]),
            (i32::MAX, &[0x02, 0x04, 0x7F, 0xFF, 0xFF, 0xFF]),
        ];
        for (value, expected) in cases {
            let mut writer = BerWriter::new();
            writer.write_integer(value);
            let encoded = writer.into_vec();
            assert_eq!(encoded, expected, "value {}", value);
            let mut reader = BerReader::new(&encoded);
            assert_eq!(reader.read_integer().unwrap(), value);
        }
    }

    #[test]
    fn test_ber_writer_boolean() {
        let mut writer = BerWriter::new();
        writer.write_boolean(true);
        writer.write_boolean(false);
        let result = writer.into_vec();
        assert_eq!(result, vec![0x01, 0x01, 0xFF, 0x01, 0x01, 0x00]);
    }

    #[test]
    fn test_ber_writer_sequence() {
        let mut writer = BerWriter::new();
        let seq_start = writer.start_sequence();
        writer.write_integer(42);
        writer.write_string("test");
        writer.end_sequence(seq_start);
        let result = writer.into_vec();
        assert_eq!(result, vec![0x30, 0x09, 0x02, 0x01, 0x2A, 0x04, 0x04, b't', b'e', b's', b't']);
    }

    #[test]
    fn test_ber_writer_long_length() {
        let mut writer = BerWriter::new();
        let seq_start = writer.start_sequence();
        // Write enough data to require long form length encoding
        for _ in 0..200 {
            writer.write_string("test");
        }
        writer.end_sequence(seq_start);
        let result = writer.into_vec();
        // 1200 content bytes -> 0x82 0x04 0xB0
        assert_eq!(&result[..4], &[0x30, 0x82, 0x04, 0xB0]);
        assert_eq!(result.len(), 4 + 1200);
        let mut reader = BerReader::new(&result);
        let seq = reader.read_sequence().unwrap();
        assert_eq!(seq.remaining(), 1200);
    }

    #[test]
    fn test_ber_reader_short_length() {
        let data = vec![0x04, 0x05, 0x68, 0x65, 0x6C, 0x6C, 0x6F]; // OCTET STRING "hello"
        let mut reader = BerReader::new(&data);
        let result = reader.read_octet_string().unwrap();
        assert_eq!(result, b"hello");
    }

    #[test]
    fn test_ber_reader_negative_integer() {
        let data = vec![0x02, 0x01, 0xFF]; // INTEGER -1
        let mut reader = BerReader::new(&data);
        assert_eq!(reader.read_integer().unwrap(), -1);

        let data = vec![0x02, 0x02, 0xFF, 0x7F]; // INTEGER -129
        let mut reader = BerReader::new(&data);
        assert_eq!(reader.read_integer().unwrap(), -129);
    }

    #[test]
    fn test_ber_reader_truncated() {
        let data = vec![0x04, 0x05, 0x68, 0x65];
        let mut reader = BerReader::new(&data);
        assert!(reader.read_octet_string().is_err());

        let data = vec![0x30, 0x80];
        let mut reader = BerReader::new(&data);
        assert!(reader.read_sequence().is_err());
    }

    #[test]
    fn test_frame_length() {
        assert_eq!(frame_length(&[0x30]).unwrap(), None);
        assert_eq!(frame_length(&[0x30, 0x03, 0x02]).unwrap(), None);
        assert_eq!(frame_length(&[0x30, 0x03, 0x02, 0x01, 0x01, 0x30]).unwrap(), Some(5));
        assert_eq!(frame_length(&[0x30, 0x82, 0x01]).unwrap(), None);
        assert!(frame_length(&[0x04, 0x00]).is_err());
        assert!(frame_length(&[0x30, 0x84, 0x7F, 0xFF, 0xFF, 0xFF]).is_err());
    }

    /// LDAPMessage with BindRequest (simple bind, auth tag 0x80): SEQUENCE { id=1, bindRequest [0] { version=3, name, simple [0] "secret" } }
    #[test]
    fn test_parse_simple_bind_request() {
        // name = "cn=admin,dc=example,dc=com" (26 bytes), password = "secret" (6 bytes)
        let msg = vec![
            0x30, 0x2c, // SEQUENCE length 44
            0x02, 0x01, 0x01, // messageID 1
            0x60, 0x27, // [APPLICATION 0] BindRequest length 39
            0x02, 0x01, 0x03, // version 3
            0x04, 0x1a, 0x63, 0x6e, 0x3d, 0x61, 0x64, 0x6d, 0x69, 0x6e, 0x2c, 0x64, 0x63, 0x3d,
            0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x2c, 0x64, 0x63, 0x3d, 0x63, 0x6f, 0x6d, // name
            0x80, 0x06, 0x73, 0x65, 0x63, 0x72, 0x65, 0x74, // [0] simple OCTET STRING "secret"
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        assert_eq!(parsed.message_id, 1);
        match &parsed.protocol_op {
            ProtocolOp::BindRequest(b) => {
                assert_eq!(b.version, 3);
                assert_eq!(b.name, "cn=admin,dc=example,dc=com");
                assert_eq!(b.authentication, BindAuthentication::Simple(b"secret".to_vec()));
            }
            _ => panic!("expected BindRequest"),
        }
        assert_eq!(encode_ldap_message(&parsed).unwrap(), msg);
    }

    #[test]
    fn test_bind_roundtrips() {
        roundtrip(LdapMessage {
            message_id: 1,
            protocol_op: ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: String::new(),
                authentication: BindAuthentication::Sasl {
                    mechanism: "DIGEST-MD5".to_string(),
                    credentials: None,
                },
            }),
            controls: Some(vec![Control {
                ctype: "1.3.6.1.4.1.42.2.27.8.5.1".to_string(),
                critical: false,
                value: None,
            }]),
        });
        roundtrip(LdapMessage {
            message_id: 1,
            protocol_op: ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::with_code(14, ""),
                server_sasl_creds: Some(b"realm=\"x\",nonce=\"abc\"".to_vec()),
            }),
            controls: None,
        });
    }

    #[test]
    fn test_search_roundtrip() {
        roundtrip(LdapMessage {
            message_id: 7,
            protocol_op: ProtocolOp::SearchRequest(SearchRequest {
                base_object: "ou=nerdherd,dc=bonsai,dc=test".to_string(),
                scope: SearchScope::WholeSubtree,
                deref_aliases: 0,
                size_limit: 0,
                time_limit: 10,
                types_only: false,
                filter: Filter::parse("(&(objectClass=person)(|(cn=chuck*)(uidNumber>=100)))").unwrap(),
                attributes: vec!["cn".to_string(), "mail".to_string()],
            }),
            controls: Some(vec![Control {
                ctype: "1.2.840.113556.1.4.319".to_string(),
                critical: true,
                value: Some(vec![0x30, 0x05, 0x02, 0x01, 0x02, 0x04, 0x00]),
            }]),
        });
        roundtrip(LdapMessage {
            message_id: 7,
            protocol_op: ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: "cn=chuck,ou=nerdherd,dc=bonsai,dc=test".to_string(),
                attributes: vec![Attribute {
                    attr_type: "mail".to_string(),
                    attr_values: vec![b"chuck@bonsai.test".to_vec(), b"c@b.t".to_vec()],
                }],
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 7,
            protocol_op: ProtocolOp::SearchResultReference(vec!["ldap://other/ou=x,dc=test??sub".to_string()]),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 7,
            protocol_op: ProtocolOp::SearchResultDone(LdapResult {
                result_code: 10,
                matched_dn: "dc=test".to_string(),
                diagnostic_message: "see referral".to_string(),
                referrals: vec!["ldap://a/".to_string(), "ldap://b/".to_string()],
            }),
            controls: None,
        });
    }

    #[test]
    fn test_update_roundtrips() {
        roundtrip(LdapMessage {
            message_id: 3,
            protocol_op: ProtocolOp::ModifyRequest(ModifyRequest {
                object: "cn=chuck,dc=test".to_string(),
                changes: vec![
                    ModifyChange {
                        operation: ModifyOperation::Add,
                        modification: Attribute {
                            attr_type: "mail".to_string(),
                            attr_values: vec![b"x@a".to_vec()],
                        },
                    },
                    ModifyChange {
                        operation: ModifyOperation::Delete,
                        modification: Attribute {
                            attr_type: "description".to_string(),
                            attr_values: vec![],
                        },
                    },
                ],
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 4,
            protocol_op: ProtocolOp::AddRequest(AddRequest {
                entry: "cn=new,dc=test".to_string(),
                attributes: vec![Attribute {
                    attr_type: "objectClass".to_string(),
                    attr_values: vec![b"top".to_vec(), b"person".to_vec()],
                }],
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 5,
            protocol_op: ProtocolOp::DelRequest(DelRequest {
                entry: "cn=old,dc=test".to_string(),
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 6,
            protocol_op: ProtocolOp::ModifyDNRequest(ModifyDNRequest {
                entry: "cn=old,dc=test".to_string(),
                newrdn: "cn=new".to_string(),
                delete_old_rdn: true,
                new_superior: Some("ou=moved,dc=test".to_string()),
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 8,
            protocol_op: ProtocolOp::CompareRequest(CompareRequest {
                entry: "cn=chuck,dc=test".to_string(),
                attr: "cn".to_string(),
                assertion_value: b"chuck".to_vec(),
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 9,
            protocol_op: ProtocolOp::CompareResponse(LdapResult::with_code(6, "")),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 10,
            protocol_op: ProtocolOp::AbandonRequest(300),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 11,
            protocol_op: ProtocolOp::UnbindRequest,
            controls: None,
        });
    }

    #[test]
    fn test_extended_roundtrips() {
        roundtrip(LdapMessage {
            message_id: 2,
            protocol_op: ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: "1.3.6.1.4.1.4203.1.11.3".to_string(),
                request_value: None,
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 2,
            protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::success(),
                response_name: Some("1.3.6.1.4.1.4203.1.11.3".to_string()),
                response_value: Some(b"dn:cn=test".to_vec()),
            }),
            controls: None,
        });
        roundtrip(LdapMessage {
            message_id: 10,
            protocol_op: ProtocolOp::IntermediateResponse(IntermediateResponse {
                response_name: Some("1.3.6.1.4.1.4203.1.9.1.4".to_string()),
                response_value: Some(vec![0x00, 0x01, 0x02]),
            }),
            controls: None,
        });
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let msg = vec![0x30, 0x05, 0x02, 0x01, 0x01, 0x7F, 0x00];
        assert!(parse_ldap_message(&msg).is_err());
    }

    #[test]
    fn test_result_code_above_255() {
        // ModifyResponse with resultCode 4096 (e-syncRefreshRequired)
        let msg = vec![
            0x30, 0x0D, 0x02, 0x01, 0x05, 0x67, 0x08, 0x0A, 0x02, 0x10, 0x00, 0x04, 0x00, 0x04, 0x00,
        ];
        let parsed = parse_ldap_message(&msg).unwrap();
        assert_eq!(parsed.protocol_op, ProtocolOp::ModifyResponse(LdapResult::with_code(4096, "")));
        assert_eq!(encode_ldap_message(&parsed).unwrap(), msg);
    }
}
