//! Typed request and response controls.
//!
//! Every request control converts into the wire-level [`Control`]; response
//! controls are recognised by OID and parsed into [`ParsedControl`]. Unknown
//! OIDs pass through untouched.

use anyhow::{Context, Result, bail};

use crate::error::PasswordPolicyKind;
use crate::ldap_protocol::{BerReader, BerWriter, Control};

pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";
pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";
pub const SORT_RESPONSE_OID: &str = "1.2.840.113556.1.4.474";
pub const VLV_REQUEST_OID: &str = "2.16.840.1.113730.3.4.9";
pub const VLV_RESPONSE_OID: &str = "2.16.840.1.113730.3.4.10";
pub const PASSWORD_POLICY_OID: &str = "1.3.6.1.4.1.42.2.27.8.5.1";
pub const MANAGE_DSA_IT_OID: &str = "2.16.840.1.113730.3.4.2";
pub const EXTENDED_DN_OID: &str = "1.2.840.113556.1.4.529";
pub const SD_FLAGS_OID: &str = "1.2.840.113556.1.4.801";

/// Mark a control as critical.
pub trait MakeCritical: Into<Control> {
    fn critical(self) -> Control {
        let mut control = self.into();
        control.critical = true;
        control
    }
}

/// Simple paged results, used both for the request and the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedResults {
    pub size: i32,
    pub cookie: Vec<u8>,
}

impl PagedResults {
    pub fn parse(value: &[u8]) -> Result<Self> {
        let mut outer = BerReader::new(value);
        let mut seq = outer.read_sequence().context("paged results value")?;
        let size = seq.read_integer()?;
        let cookie = seq.read_octet_string()?;
        Ok(PagedResults { size, cookie })
    }
}

impl From<PagedResults> for Control {
    fn from(pr: PagedResults) -> Control {
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        writer.write_integer(pr.size);
        writer.write_octet_string(&pr.cookie);
        writer.end_sequence(seq);
        Control {
            ctype: PAGED_RESULTS_OID.to_string(),
            critical: false,
            value: Some(writer.into_vec()),
        }
    }
}

impl MakeCritical for PagedResults {}

/// One server-side sort key. A leading `-` on the textual form means reverse order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub attr: String,
    pub ordering_rule: Option<String>,
    pub reverse: bool,
}

impl SortKey {
    pub fn new(attr: &str) -> Self {
        match attr.strip_prefix('-') {
            Some(name) => SortKey {
                attr: name.to_string(),
                ordering_rule: None,
                reverse: true,
            },
            None => SortKey {
                attr: attr.to_string(),
                ordering_rule: None,
                reverse: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortRequest {
    pub keys: Vec<SortKey>,
}

impl SortRequest {
    pub fn parse(value: &[u8]) -> Result<Self> {
        let mut outer = BerReader::new(value);
        let mut list = outer.read_sequence()?;
        let mut keys = Vec::new();
        while list.remaining() > 0 {
            let mut key = list.read_sequence()?;
            let attr = key.read_string()?;
            let mut ordering_rule = None;
            let mut reverse = false;
            while key.remaining() > 0 {
                match key.read_tag()? {
                    0x80 => ordering_rule = Some(key.read_string_value()?),
                    0x81 => reverse = key.read_boolean_value()?,
                    tag => bail!("sort key: unexpected tag 0x{:02X}", tag),
                }
            }
            keys.push(SortKey { attr, ordering_rule, reverse });
        }
        Ok(SortRequest { keys })
    }
}

impl From<SortRequest> for Control {
    fn from(req: SortRequest) -> Control {
        let mut writer = BerWriter::new();
        let list = writer.start_sequence();
        for key in &req.keys {
            let seq = writer.start_sequence();
            writer.write_string(&key.attr);
            if let Some(ref rule) = key.ordering_rule {
                writer.write_tagged_octets(0x80, rule.as_bytes());
            }
            if key.reverse {
                writer.write_boolean_tagged(0x81, true);
            }
            writer.end_sequence(seq);
        }
        writer.end_sequence(list);
        Control {
            ctype: SORT_REQUEST_OID.to_string(),
            critical: false,
            value: Some(writer.into_vec()),
        }
    }
}

impl MakeCritical for SortRequest {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortResult {
    pub result: i32,
    pub attr: Option<String>,
}

impl SortResult {
    pub fn parse(value: &[u8]) -> Result<Self> {
        let mut outer = BerReader::new(value);
        let mut seq = outer.read_sequence()?;
        let result = seq.read_enumerated()?;
        let attr = if seq.remaining() > 0 {
            seq.read_tag()?;
            Some(seq.read_string_value()?)
        } else {
            None
        };
        Ok(SortResult { result, attr })
    }

    pub fn to_control(&self) -> Control {
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        writer.write_enumerated(self.result);
        if let Some(ref attr) = self.attr {
            writer.write_tagged_octets(0x80, attr.as_bytes());
        }
        writer.end_sequence(seq);
        Control {
            ctype: SORT_RESPONSE_OID.to_string(),
            critical: false,
            value: Some(writer.into_vec()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlvTarget {
    ByOffset { offset: i32, content_count: i32 },
    GreaterOrEqual(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvRequest {
    pub before_count: i32,
    pub after_count: i32,
    pub target: VlvTarget,
    pub context_id: Option<Vec<u8>>,
}

impl VlvRequest {
    pub fn parse(value: &[u8]) -> Result<Self> {
        let mut outer = BerReader::new(value);
        let mut seq = outer.read_sequence()?;
        let before_count = seq.read_integer()?;
        let after_count = seq.read_integer()?;
        let target = match seq.read_tag()? {
            0xA0 => {
                let mut by_offset = seq.read_constructed_value()?;
                VlvTarget::ByOffset {
                    offset: by_offset.read_integer()?,
                    content_count: by_offset.read_integer()?,
                }
            }
            0x81 => VlvTarget::GreaterOrEqual(seq.read_octet_string_value()?),
            tag => bail!("VLV request: unexpected target tag 0x{:02X}", tag),
        };
        let context_id = if seq.remaining() > 0 { Some(seq.read_octet_string()?) } else { None };
        Ok(VlvRequest {
            before_count,
            after_count,
            target,
            context_id,
        })
    }
}

impl From<VlvRequest> for Control {
    fn from(req: VlvRequest) -> Control {
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        writer.write_integer(req.before_count);
        writer.write_integer(req.after_count);
        match req.target {
            VlvTarget::ByOffset { offset, content_count } => {
                let pos = writer.start_constructed(0xA0);
                writer.write_integer(offset);
                writer.write_integer(content_count);
                writer.end_constructed(pos);
            }
            VlvTarget::GreaterOrEqual(ref value) => writer.write_tagged_octets(0x81, value),
        }
        if let Some(ref ctx) = req.context_id {
            writer.write_octet_string(ctx);
        }
        writer.end_sequence(seq);
        Control {
            ctype: VLV_REQUEST_OID.to_string(),
            critical: false,
            value: Some(writer.into_vec()),
        }
    }
}

impl MakeCritical for VlvRequest {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvResult {
    pub target_position: i32,
    pub list_count: i32,
    pub result: i32,
    pub context_id: Option<Vec<u8>>,
}

impl VlvResult {
    pub fn parse(value: &[u8]) -> Result<Self> {
        let mut outer = BerReader::new(value);
        let mut seq = outer.read_sequence()?;
        let target_position = seq.read_integer()?;
        let list_count = seq.read_integer()?;
        let result = seq.read_enumerated()?;
        let context_id = if seq.remaining() > 0 { Some(seq.read_octet_string()?) } else { None };
        Ok(VlvResult {
            target_position,
            list_count,
            result,
            context_id,
        })
    }

    pub fn to_control(&self) -> Control {
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        writer.write_integer(self.target_position);
        writer.write_integer(self.list_count);
        writer.write_enumerated(self.result);
        if let Some(ref ctx) = self.context_id {
            writer.write_octet_string(ctx);
        }
        writer.end_sequence(seq);
        Control {
            ctype: VLV_RESPONSE_OID.to_string(),
            critical: false,
            value: Some(writer.into_vec()),
        }
    }
}

/// Password policy request control (no value).
#[derive(Debug, Clone, Copy, Default)]
pub struct PasswordPolicyRequest;

impl From<PasswordPolicyRequest> for Control {
    fn from(_: PasswordPolicyRequest) -> Control {
        Control {
            ctype: PASSWORD_POLICY_OID.to_string(),
            critical: false,
            value: None,
        }
    }
}

impl MakeCritical for PasswordPolicyRequest {}

/// Password policy response: expiry warning, remaining grace logins, or an error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PasswordPolicyInfo {
    pub oid: String,
    pub expire: Option<i32>,
    pub grace: Option<i32>,
    pub error: Option<PasswordPolicyKind>,
}

impl PasswordPolicyInfo {
    pub fn parse(value: Option<&[u8]>) -> Result<Self> {
        let mut info = PasswordPolicyInfo {
            oid: PASSWORD_POLICY_OID.to_string(),
            ..Default::default()
        };
        let Some(value) = value else {
            return Ok(info);
        };
        let mut outer = BerReader::new(value);
        let mut seq = outer.read_sequence()?;
        while seq.remaining() > 0 {
            match seq.read_tag()? {
                0xA0 => {
                    let mut warning = seq.read_constructed_value()?;
                    match warning.read_tag()? {
                        0x80 => info.expire = Some(warning.read_integer_value()?),
                        0x81 => info.grace = Some(warning.read_integer_value()?),
                        tag => bail!("ppolicy warning: unexpected tag 0x{:02X}", tag),
                    }
                }
                0x81 => {
                    let code = seq.read_integer_value()?;
                    let kind = u8::try_from(code)
                        .ok()
                        .and_then(PasswordPolicyKind::from_ppolicy_error)
                        .with_context(|| format!("unknown ppolicy error {}", code))?;
                    info.error = Some(kind);
                }
                tag => bail!("ppolicy response: unexpected tag 0x{:02X}", tag),
            }
        }
        Ok(info)
    }

    pub fn to_control(&self) -> Control {
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        if self.expire.is_some() || self.grace.is_some() {
            let warning = writer.start_constructed(0xA0);
            if let Some(expire) = self.expire {
                writer.write_integer_tagged(0x80, expire);
            } else if let Some(grace) = self.grace {
                writer.write_integer_tagged(0x81, grace);
            }
            writer.end_constructed(warning);
        }
        if let Some(kind) = self.error {
            writer.write_integer_tagged(0x81, kind.ppolicy_error() as i32);
        }
        writer.end_sequence(seq);
        Control {
            ctype: PASSWORD_POLICY_OID.to_string(),
            critical: false,
            value: Some(writer.into_vec()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ManageDsaIt;

impl From<ManageDsaIt> for Control {
    fn from(_: ManageDsaIt) -> Control {
        Control {
            ctype: MANAGE_DSA_IT_OID.to_string(),
            critical: true,
            value: None,
        }
    }
}

/// Active Directory extended DN format: 0 renders GUID/SID in hex, 1 in standard form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedDn(pub i32);

impl From<ExtendedDn> for Control {
    fn from(ed: ExtendedDn) -> Control {
        Control {
            ctype: EXTENDED_DN_OID.to_string(),
            critical: false,
            value: Some(integer_sequence(ed.0)),
        }
    }
}

impl MakeCritical for ExtendedDn {}

/// Active Directory security descriptor flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdFlags(pub i32);

impl From<SdFlags> for Control {
    fn from(sd: SdFlags) -> Control {
        Control {
            ctype: SD_FLAGS_OID.to_string(),
            critical: false,
            value: Some(integer_sequence(sd.0)),
        }
    }
}

impl MakeCritical for SdFlags {}

fn integer_sequence(value: i32) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let seq = writer.start_sequence();
    writer.write_integer(value);
    writer.end_sequence(seq);
    writer.into_vec()
}

/// Read back a control whose value is `SEQUENCE { INTEGER }`.
pub fn parse_integer_sequence(value: &[u8]) -> Result<i32> {
    let mut outer = BerReader::new(value);
    let mut seq = outer.read_sequence()?;
    seq.read_integer()
}

/// Response control with a typed view for recognised OIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedControl {
    PagedResults(PagedResults),
    SortResult(SortResult),
    VlvResult(VlvResult),
    PasswordPolicy(PasswordPolicyInfo),
    Unknown(Control),
}

pub fn parse_response_control(control: &Control) -> Result<ParsedControl> {
    let value = control.value.as_deref();
    let parsed = match control.ctype.as_str() {
        PAGED_RESULTS_OID => ParsedControl::PagedResults(PagedResults::parse(require(value, PAGED_RESULTS_OID)?)?),
        SORT_RESPONSE_OID => ParsedControl::SortResult(SortResult::parse(require(value, SORT_RESPONSE_OID)?)?),
        VLV_RESPONSE_OID => ParsedControl::VlvResult(VlvResult::parse(require(value, VLV_RESPONSE_OID)?)?),
        PASSWORD_POLICY_OID => ParsedControl::PasswordPolicy(PasswordPolicyInfo::parse(value)?),
        _ => ParsedControl::Unknown(control.clone()),
    };
    Ok(parsed)
}

fn require<'a>(value: Option<&'a [u8]>, oid: &str) -> Result<&'a [u8]> {
    value.with_context(|| format!("control {} carries no value", oid))
}

/// First control with the given OID.
pub fn find<'a>(controls: &'a [Control], oid: &str) -> Option<&'a Control> {
    controls.iter().find(|c| c.ctype == oid)
}
