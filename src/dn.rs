//! RFC 4514 distinguished names.
//!
//! A [`DistinguishedName`] keeps its RDNs as `(type, unescaped value)` pairs.
//! Rendering escapes values again, so `parse(dn.to_string()) == dn` holds for
//! every well-formed input. Equality ignores ASCII case and the order of AVAs
//! inside a multi-valued RDN.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{LdapError, Result};

/// One RDN: a non-empty set of attribute type/value pairs joined by `+`.
pub type Rdn = Vec<(String, String)>;

#[derive(Debug, Clone, Default)]
pub struct DistinguishedName {
    rdns: Vec<Rdn>,
}

impl DistinguishedName {
    pub fn parse(input: &str) -> Result<Self> {
        let rdns = Parser::new(input)
            .parse_dn()
            .map_err(|reason| LdapError::InvalidDn(format!("{:?}: {}", input, reason)))?;
        Ok(Self { rdns })
    }

    /// The root (empty) DN.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rdns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    fn resolve_index(&self, index: isize) -> Option<usize> {
        let len = self.rdns.len() as isize;
        let idx = if index < 0 { len + index } else { index };
        if (0..len).contains(&idx) { Some(idx as usize) } else { None }
    }

    /// The RDN at `index` rendered as a string; negative indices count from the end.
    pub fn rdn(&self, index: isize) -> Option<String> {
        self.resolve_index(index).map(|i| render_rdn(&self.rdns[i]))
    }

    /// RDNs `start..end` joined by `,`. Bounds are clamped, never out of range.
    pub fn slice(&self, start: isize, end: isize) -> String {
        let len = self.rdns.len() as isize;
        let clamp = |i: isize| -> usize {
            let i = if i < 0 { len + i } else { i };
            i.clamp(0, len) as usize
        };
        let (s, e) = (clamp(start), clamp(end));
        if s >= e {
            return String::new();
        }
        self.rdns[s..e].iter().map(|r| render_rdn(r)).collect::<Vec<_>>().join(",")
    }

    /// Replace one RDN, validating the new text.
    pub fn set_rdn(&mut self, index: isize, rdn: &str) -> Result<()> {
        let idx = self
            .resolve_index(index)
            .ok_or_else(|| LdapError::InvalidArgument(format!("RDN index {} out of range", index)))?;
        let mut parsed = Self::parse(rdn)?;
        if parsed.rdns.len() != 1 {
            return Err(LdapError::InvalidDn(format!("{:?}: expected exactly one RDN", rdn)));
        }
        self.rdns[idx] = parsed.rdns.remove(0);
        Ok(())
    }

    /// The DN without its first RDN.
    pub fn parent(&self) -> Option<DistinguishedName> {
        if self.rdns.is_empty() {
            return None;
        }
        Some(DistinguishedName {
            rdns: self.rdns[1..].to_vec(),
        })
    }

    /// Whether `self` lies at or below `base`.
    pub fn is_within(&self, base: &DistinguishedName) -> bool {
        if base.rdns.len() > self.rdns.len() {
            return false;
        }
        let offset = self.rdns.len() - base.rdns.len();
        self.rdns[offset..]
            .iter()
            .zip(base.rdns.iter())
            .all(|(a, b)| canonical_rdn(a) == canonical_rdn(b))
    }

    fn canonical(&self) -> Vec<Vec<(String, String)>> {
        self.rdns.iter().map(|r| canonical_rdn(r)).collect()
    }
}

fn canonical_rdn(rdn: &Rdn) -> Vec<(String, String)> {
    let mut avas: Vec<(String, String)> = rdn
        .iter()
        .map(|(t, v)| (t.to_ascii_lowercase(), v.to_ascii_lowercase()))
        .collect();
    avas.sort();
    avas
}

fn render_rdn(rdn: &Rdn) -> String {
    rdn.iter()
        .map(|(t, v)| format!("{}={}", t, escape_attribute_value(v)))
        .collect::<Vec<_>>()
        .join("+")
}

impl PartialEq for DistinguishedName {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for DistinguishedName {}

impl Hash for DistinguishedName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self.rdns.iter().map(|r| render_rdn(r)).collect::<Vec<_>>().join(",");
        f.write_str(&rendered)
    }
}

impl FromStr for DistinguishedName {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for DistinguishedName {
    type Error = LdapError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<DistinguishedName> for String {
    fn from(value: DistinguishedName) -> Self {
        value.to_string()
    }
}

/// Escape an attribute value for use inside a DN string.
pub fn escape_attribute_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 4);
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        match c {
            '"' | '+' | ',' | ';' | '<' | '=' | '>' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\0' => out.push_str("\\00"),
            ' ' if i == 0 || i == last => out.push_str("\\ "),
            '#' if i == 0 => out.push_str("\\#"),
            _ => out.push(c),
        }
    }
    out
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn parse_dn(&mut self) -> std::result::Result<Vec<Rdn>, String> {
        self.skip_spaces();
        if self.peek().is_none() {
            return Ok(Vec::new());
        }
        let mut rdns = Vec::new();
        loop {
            rdns.push(self.parse_rdn()?);
            match self.peek() {
                Some(b',') => self.pos += 1,
                None => break,
                Some(c) => return Err(format!("unexpected '{}' at {}", c as char, self.pos)),
            }
        }
        Ok(rdns)
    }

    fn parse_rdn(&mut self) -> std::result::Result<Rdn, String> {
        let mut avas = Vec::new();
        loop {
            avas.push(self.parse_ava()?);
            if self.peek() == Some(b'+') {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(avas)
    }

    fn parse_ava(&mut self) -> std::result::Result<(String, String), String> {
        self.skip_spaces();
        let attr_type = self.parse_type()?;
        self.skip_spaces();
        if self.peek() != Some(b'=') {
            return Err(format!("missing '=' after attribute type {:?}", attr_type));
        }
        self.pos += 1;
        self.skip_spaces();
        let value = match self.peek() {
            Some(b'#') => self.parse_hex_value()?,
            Some(b'"') => self.parse_quoted_value()?,
            _ => self.parse_string_value()?,
        };
        self.skip_spaces();
        Ok((attr_type, value))
    }

    fn parse_type(&mut self) -> std::result::Result<String, String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() => {
                while let Some(c) = self.peek() {
                    if c.is_ascii_alphanumeric() || c == b'-' {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
            }
            Some(c) if c.is_ascii_digit() => {
                // numericoid: number ( "." number )*
                let mut expect_digit = true;
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        expect_digit = false;
                    } else if c == b'.' && !expect_digit {
                        expect_digit = true;
                    } else {
                        break;
                    }
                    self.pos += 1;
                }
                if expect_digit {
                    return Err(format!("malformed numeric OID at {}", start));
                }
            }
            _ => return Err(format!("missing attribute type at {}", start)),
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).to_string())
    }

    fn parse_hex_value(&mut self) -> std::result::Result<String, String> {
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_hexdigit() {
                self.pos += 1;
            } else {
                break;
            }
        }
        let hex = &self.input[start..self.pos];
        if hex.is_empty() || hex.len() % 2 != 0 {
            return Err(format!("malformed hex value at {}", start));
        }
        let bytes = hex
            .chunks(2)
            .map(|pair| u8::from_str_radix(&String::from_utf8_lossy(pair), 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|e| e.to_string())?;
        String::from_utf8(bytes).map_err(|_| format!("hex value at {} is not UTF-8", start))
    }

    fn parse_quoted_value(&mut self) -> std::result::Result<String, String> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err("unterminated quoted value".to_string()),
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => out.push(self.parse_escape()?),
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        String::from_utf8(out).map_err(|_| "quoted value is not UTF-8".to_string())
    }

    fn parse_string_value(&mut self) -> std::result::Result<String, String> {
        let mut out = Vec::new();
        // Length of `out` up to the last byte that must be kept (escaped or non-space).
        let mut keep = 0;
        while let Some(c) = self.peek() {
            match c {
                b',' | b'+' => break,
                b'\\' => {
                    out.push(self.parse_escape()?);
                    keep = out.len();
                }
                b'"' | b';' | b'<' | b'>' => {
                    return Err(format!("unescaped '{}' at {}", c as char, self.pos));
                }
                _ => {
                    out.push(c);
                    self.pos += 1;
                    if c != b' ' {
                        keep = out.len();
                    }
                }
            }
        }
        out.truncate(keep);
        if out.is_empty() {
            return Err(format!("empty attribute value at {}", self.pos));
        }
        String::from_utf8(out).map_err(|_| "attribute value is not UTF-8".to_string())
    }

    /// Consume `\c` or `\HH` and return the decoded byte.
    fn parse_escape(&mut self) -> std::result::Result<u8, String> {
        self.pos += 1;
        let Some(c) = self.peek() else {
            return Err("unterminated escape sequence".to_string());
        };
        if c.is_ascii_hexdigit() {
            if let Some(&lo) = self.input.get(self.pos + 1) {
                if lo.is_ascii_hexdigit() {
                    let pair = [c, lo];
                    let byte = u8::from_str_radix(&String::from_utf8_lossy(&pair), 16).map_err(|e| e.to_string())?;
                    self.pos += 2;
                    return Ok(byte);
                }
            }
        }
        match c {
            b',' | b'=' | b'+' | b'<' | b'>' | b'#' | b';' | b'\\' | b'"' | b' ' => {
                self.pos += 1;
                Ok(c)
            }
            _ => Err(format!("invalid escape '\\{}' at {}", c as char, self.pos)),
        }
    }
}
