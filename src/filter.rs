// RFC 4515 search filters: string parser, BER encoding, rendering

use anyhow::bail;

use crate::error::{LdapError, Result};
use crate::ldap_protocol::{BerReader, BerWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, Vec<u8>),
    Substrings {
        attr: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_: Option<Vec<u8>>,
    },
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Present(String),
    Approx(String, Vec<u8>),
    ExtensibleMatch {
        matching_rule: Option<String>,
        attr: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

const TAG_AND: u8 = 0xA0;
const TAG_OR: u8 = 0xA1;
const TAG_NOT: u8 = 0xA2;
const TAG_EQUALITY: u8 = 0xA3;
const TAG_SUBSTRINGS: u8 = 0xA4;
const TAG_GE: u8 = 0xA5;
const TAG_LE: u8 = 0xA6;
const TAG_PRESENT: u8 = 0x87;
const TAG_APPROX: u8 = 0xA8;
const TAG_EXTENSIBLE: u8 = 0xA9;

impl Filter {
    /// Parse an RFC 4515 filter string. The outer parentheses may be omitted.
    pub fn parse(input: &str) -> Result<Filter> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(LdapError::InvalidArgument("empty search filter".to_string()));
        }
        let wrapped;
        let text = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({})", trimmed);
            wrapped.as_str()
        };
        let mut parser = Parser {
            input: text.as_bytes(),
            pos: 0,
        };
        let filter = parser
            .parse_filter()
            .map_err(|e| LdapError::InvalidArgument(format!("invalid filter {:?}: {}", input, e)))?;
        if parser.pos != parser.input.len() {
            return Err(LdapError::InvalidArgument(format!(
                "invalid filter {:?}: trailing characters at {}",
                input, parser.pos
            )));
        }
        Ok(filter)
    }

    /// Render back to RFC 4515 text, escaping `(`, `)`, `*`, `\` and NUL.
    pub fn to_ldap_string(&self) -> String {
        match self {
            Filter::And(items) => format!("(&{})", items.iter().map(|f| f.to_ldap_string()).collect::<String>()),
            Filter::Or(items) => format!("(|{})", items.iter().map(|f| f.to_ldap_string()).collect::<String>()),
            Filter::Not(inner) => format!("(!{})", inner.to_ldap_string()),
            Filter::Equality(attr, value) => format!("({}={})", attr, ldap_escape_bytes(value)),
            Filter::Substrings { attr, initial, any, final_ } => {
                let mut out = format!("({}=", attr);
                if let Some(init) = initial {
                    out.push_str(&ldap_escape_bytes(init));
                }
                out.push('*');
                for part in any {
                    out.push_str(&ldap_escape_bytes(part));
                    out.push('*');
                }
                if let Some(fin) = final_ {
                    out.push_str(&ldap_escape_bytes(fin));
                }
                out.push(')');
                out
            }
            Filter::GreaterOrEqual(attr, value) => format!("({}>={})", attr, ldap_escape_bytes(value)),
            Filter::LessOrEqual(attr, value) => format!("({}<={})", attr, ldap_escape_bytes(value)),
            Filter::Present(attr) => format!("({}=*)", attr),
            Filter::Approx(attr, value) => format!("({}~={})", attr, ldap_escape_bytes(value)),
            Filter::ExtensibleMatch { matching_rule, attr, value, dn_attributes } => {
                let mut out = String::from("(");
                if let Some(a) = attr {
                    out.push_str(a);
                }
                if *dn_attributes {
                    out.push_str(":dn");
                }
                if let Some(rule) = matching_rule {
                    out.push(':');
                    out.push_str(rule);
                }
                out.push_str(":=");
                out.push_str(&ldap_escape_bytes(value));
                out.push(')');
                out
            }
        }
    }

    pub(crate) fn write_ber(&self, writer: &mut BerWriter) {
        match self {
            Filter::And(items) | Filter::Or(items) => {
                let tag = if matches!(self, Filter::And(_)) { TAG_AND } else { TAG_OR };
                let pos = writer.start_constructed(tag);
                for item in items {
                    item.write_ber(writer);
                }
                writer.end_constructed(pos);
            }
            Filter::Not(inner) => {
                let pos = writer.start_constructed(TAG_NOT);
                inner.write_ber(writer);
                writer.end_constructed(pos);
            }
            Filter::Equality(attr, value) => write_ava(writer, TAG_EQUALITY, attr, value),
            Filter::GreaterOrEqual(attr, value) => write_ava(writer, TAG_GE, attr, value),
            Filter::LessOrEqual(attr, value) => write_ava(writer, TAG_LE, attr, value),
            Filter::Approx(attr, value) => write_ava(writer, TAG_APPROX, attr, value),
            Filter::Present(attr) => writer.write_tagged_octets(TAG_PRESENT, attr.as_bytes()),
            Filter::Substrings { attr, initial, any, final_ } => {
                let pos = writer.start_constructed(TAG_SUBSTRINGS);
                writer.write_string(attr);
                let subs = writer.start_sequence();
                if let Some(init) = initial {
                    writer.write_tagged_octets(0x80, init);
                }
                for part in any {
                    writer.write_tagged_octets(0x81, part);
                }
                if let Some(fin) = final_ {
                    writer.write_tagged_octets(0x82, fin);
                }
                writer.end_sequence(subs);
                writer.end_constructed(pos);
            }
            Filter::ExtensibleMatch { matching_rule, attr, value, dn_attributes } => {
                let pos = writer.start_constructed(TAG_EXTENSIBLE);
                if let Some(rule) = matching_rule {
                    writer.write_tagged_octets(0x81, rule.as_bytes());
                }
                if let Some(a) = attr {
                    writer.write_tagged_octets(0x82, a.as_bytes());
                }
                writer.write_tagged_octets(0x83, value);
                if *dn_attributes {
                    writer.write_boolean_tagged(0x84, true);
                }
                writer.end_constructed(pos);
            }
        }
    }

    pub(crate) fn parse_ber(reader: &mut BerReader) -> anyhow::Result<Filter> {
        let tag = reader.read_tag()?;
        let filter = match tag {
            TAG_AND | TAG_OR => {
                let mut set = reader.read_constructed_value()?;
                let mut items = Vec::new();
                while set.remaining() > 0 {
                    items.push(Filter::parse_ber(&mut set)?);
                }
                if tag == TAG_AND { Filter::And(items) } else { Filter::Or(items) }
            }
            TAG_NOT => {
                let mut inner = reader.read_constructed_value()?;
                Filter::Not(Box::new(Filter::parse_ber(&mut inner)?))
            }
            TAG_EQUALITY | TAG_GE | TAG_LE | TAG_APPROX => {
                let mut ava = reader.read_constructed_value()?;
                let attr = ava.read_string()?;
                let value = ava.read_octet_string()?;
                match tag {
                    TAG_EQUALITY => Filter::Equality(attr, value),
                    TAG_GE => Filter::GreaterOrEqual(attr, value),
                    TAG_LE => Filter::LessOrEqual(attr, value),
                    _ => Filter::Approx(attr, value),
                }
            }
            TAG_PRESENT => Filter::Present(reader.read_string_value()?),
            TAG_SUBSTRINGS => {
                let mut body = reader.read_constructed_value()?;
                let attr = body.read_string()?;
                let mut subs = body.read_sequence()?;
                let mut initial = None;
                let mut any = Vec::new();
                let mut final_ = None;
                while subs.remaining() > 0 {
                    match subs.read_tag()? {
                        0x80 => initial = Some(subs.read_octet_string_value()?),
                        0x81 => any.push(subs.read_octet_string_value()?),
                        0x82 => final_ = Some(subs.read_octet_string_value()?),
                        t => bail!("Invalid substring choice tag: 0x{:02X}", t),
                    }
                }
                if initial.is_none() && any.is_empty() && final_.is_none() {
                    bail!("Empty substring filter for {}", attr);
                }
                Filter::Substrings { attr, initial, any, final_ }
            }
            TAG_EXTENSIBLE => {
                let mut body = reader.read_constructed_value()?;
                let mut matching_rule = None;
                let mut attr = None;
                let mut value = Vec::new();
                let mut dn_attributes = false;
                while body.remaining() > 0 {
                    match body.read_tag()? {
                        0x81 => matching_rule = Some(body.read_string_value()?),
                        0x82 => attr = Some(body.read_string_value()?),
                        0x83 => value = body.read_octet_string_value()?,
                        0x84 => dn_attributes = body.read_boolean_value()?,
                        t => bail!("Invalid extensible match tag: 0x{:02X}", t),
                    }
                }
                Filter::ExtensibleMatch { matching_rule, attr, value, dn_attributes }
            }
            _ => bail!("Unsupported filter tag: 0x{:02X}", tag),
        };
        Ok(filter)
    }
}

impl std::str::FromStr for Filter {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Self> {
        Filter::parse(s)
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_ldap_string())
    }
}

fn write_ava(writer: &mut BerWriter, tag: u8, attr: &str, value: &[u8]) {
    let pos = writer.start_constructed(tag);
    writer.write_string(attr);
    writer.write_octet_string(value);
    writer.end_constructed(pos);
}

/// Escape a filter assertion value.
pub fn ldap_escape(value: &str) -> String {
    ldap_escape_bytes(value.as_bytes())
}

/// Escape raw assertion bytes; non-UTF-8 bytes are hex-escaped as well.
pub fn ldap_escape_bytes(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len());
    match std::str::from_utf8(value) {
        Ok(text) => {
            for c in text.chars() {
                match c {
                    '*' | '(' | ')' | '\\' | '\0' => out.push_str(&format!("\\{:02x}", c as u8)),
                    _ => out.push(c),
                }
            }
        }
        Err(_) => {
            for b in value {
                out.push_str(&format!("\\{:02x}", b));
            }
        }
    }
    out
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> anyhow::Result<()> {
        match self.peek() {
            Some(b) if b == c => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => bail!("expected '{}' at {}, found '{}'", c as char, self.pos, b as char),
            None => bail!("expected '{}' at end of input", c as char),
        }
    }

    fn parse_filter(&mut self) -> anyhow::Result<Filter> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => bail!("unexpected end of filter"),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> anyhow::Result<Vec<Filter>> {
        let mut items = Vec::new();
        while self.peek() == Some(b'(') {
            items.push(self.parse_filter()?);
        }
        if items.is_empty() {
            bail!("empty filter list at {}", self.pos);
        }
        Ok(items)
    }

    fn parse_item(&mut self) -> anyhow::Result<Filter> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b'=' | b'~' | b'>' | b'<' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        let lhs = std::str::from_utf8(&self.input[start..self.pos])?.to_string();
        if lhs.is_empty() {
            bail!("missing attribute description at {}", start);
        }

        let op = match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                b'='
            }
            Some(c @ (b'~' | b'>' | b'<')) => {
                self.pos += 1;
                self.expect(b'=')?;
                c
            }
            _ => bail!("missing filter operator at {}", self.pos),
        };

        let raw_start = self.pos;
        while let Some(b) = self.peek() {
            if b == b')' || b == b'(' {
                break;
            }
            self.pos += 1;
        }
        let raw = &self.input[raw_start..self.pos];

        if lhs.ends_with(':') {
            if op != b'=' {
                bail!("extensible match must use ':='");
            }
            return parse_extensible(&lhs[..lhs.len() - 1], raw);
        }
        validate_attr(&lhs)?;

        match op {
            b'~' => Ok(Filter::Approx(lhs, unescape(raw)?)),
            b'>' => Ok(Filter::GreaterOrEqual(lhs, unescape(raw)?)),
            b'<' => Ok(Filter::LessOrEqual(lhs, unescape(raw)?)),
            _ => {
                if raw == b"*" {
                    return Ok(Filter::Present(lhs));
                }
                if !raw.contains(&b'*') {
                    return Ok(Filter::Equality(lhs, unescape(raw)?));
                }
                let parts: Vec<&[u8]> = raw.split(|b| *b == b'*').collect();
                let last = parts.len() - 1;
                let mut initial = None;
                let mut any = Vec::new();
                let mut final_ = None;
                for (i, part) in parts.iter().enumerate() {
                    if part.is_empty() {
                        continue;
                    }
                    let value = unescape(part)?;
                    if i == 0 {
                        initial = Some(value);
                    } else if i == last {
                        final_ = Some(value);
                    } else {
                        any.push(value);
                    }
                }
                if initial.is_none() && any.is_empty() && final_.is_none() {
                    bail!("substring filter for {:?} has no assertion value", lhs);
                }
                Ok(Filter::Substrings { attr: lhs, initial, any, final_ })
            }
        }
    }
}

/// `attr[:dn][:rule]` or `[:dn]:rule`, with the trailing ':' of ':=' already stripped.
fn parse_extensible(lhs: &str, raw: &[u8]) -> anyhow::Result<Filter> {
    let mut parts = lhs.split(':');
    let first = parts.next().unwrap_or_default();
    let attr = if first.is_empty() {
        None
    } else {
        validate_attr(first)?;
        Some(first.to_string())
    };
    let mut dn_attributes = false;
    let mut matching_rule = None;
    for part in parts {
        if part.eq_ignore_ascii_case("dn") && !dn_attributes && matching_rule.is_none() {
            dn_attributes = true;
        } else if matching_rule.is_none() && !part.is_empty() {
            matching_rule = Some(part.to_string());
        } else {
            bail!("invalid extensible match component {:?}", part);
        }
    }
    if attr.is_none() && matching_rule.is_none() {
        bail!("extensible match needs an attribute or a matching rule");
    }
    Ok(Filter::ExtensibleMatch {
        matching_rule,
        attr,
        value: unescape(raw)?,
        dn_attributes,
    })
}

fn validate_attr(attr: &str) -> anyhow::Result<()> {
    // Options such as ";binary" are allowed after the type.
    let base = attr.split(';').next().unwrap_or_default();
    let ok = !base.is_empty()
        && base.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !ok {
        bail!("invalid attribute description {:?}", attr);
    }
    Ok(())
}

fn unescape(raw: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            if i + 2 >= raw.len() {
                bail!("truncated escape sequence");
            }
            let hex = std::str::from_utf8(&raw[i + 1..i + 3])?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| anyhow::anyhow!("invalid escape \\{}", hex))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    Ok(out)
}
