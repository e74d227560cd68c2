// LDAP URLs (RFC 4516): ldap://, ldaps:// and ldapi://

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

use crate::dn::DistinguishedName;
use crate::error::{LdapError, Result};
use crate::ldap_protocol::SearchScope;

const DN_PCT_ENCODING_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?');

const QUERY_PCT_ENCODING_SET: &AsciiSet = &DN_PCT_ENCODING_SET.add(b',');

const SOCKET_PCT_ENCODING_SET: &AsciiSet = &DN_PCT_ENCODING_SET.add(b'/').add(b':');

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Ldap,
    Ldaps,
    Ldapi,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Ldap => 389,
            Scheme::Ldaps => 636,
            Scheme::Ldapi => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Ldap => "ldap",
            Scheme::Ldaps => "ldaps",
            Scheme::Ldapi => "ldapi",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LdapUrl {
    scheme: Scheme,
    host: String,
    port: u16,
    ipv6: bool,
    base_dn: DistinguishedName,
    attributes: Vec<String>,
    scope: Option<SearchScope>,
    filter: Option<String>,
    extensions: Vec<String>,
}

impl Default for LdapUrl {
    /// `ldap://localhost`
    fn default() -> Self {
        Self {
            scheme: Scheme::Ldap,
            host: "localhost".to_string(),
            port: Scheme::Ldap.default_port(),
            ipv6: false,
            base_dn: DistinguishedName::root(),
            attributes: Vec::new(),
            scope: None,
            filter: None,
            extensions: Vec::new(),
        }
    }
}

fn invalid(input: &str, reason: &str) -> LdapError {
    LdapError::InvalidArgument(format!("invalid LDAP URL {:?}: {}", input, reason))
}

fn decode(input: &str, part: &str) -> Result<String> {
    percent_decode_str(part)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| invalid(input, "percent-encoded part is not valid UTF-8"))
}

impl LdapUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let (scheme_str, rest) = input.split_once("://").ok_or_else(|| invalid(input, "missing scheme"))?;
        let scheme = match scheme_str.to_ascii_lowercase().as_str() {
            "ldap" => Scheme::Ldap,
            "ldaps" => Scheme::Ldaps,
            "ldapi" => Scheme::Ldapi,
            other => return Err(invalid(input, &format!("unknown scheme {:?}", other))),
        };

        let (hostport, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        let (host, port, ipv6) = if scheme == Scheme::Ldapi {
            let socket = decode(input, hostport)?;
            if socket.is_empty() {
                return Err(invalid(input, "missing socket path"));
            }
            (socket, 0, false)
        } else {
            Self::parse_hostport(input, hostport, scheme)?
        };

        let mut url = LdapUrl {
            scheme,
            host,
            port,
            ipv6,
            base_dn: DistinguishedName::root(),
            attributes: Vec::new(),
            scope: None,
            filter: None,
            extensions: Vec::new(),
        };

        let Some(path) = path else {
            return Ok(url);
        };
        let mut segments = path.split('?');
        if let Some(dn) = segments.next() {
            url.base_dn = DistinguishedName::parse(&decode(input, dn)?)?;
        }
        if let Some(attrs) = segments.next() {
            url.attributes = attrs
                .split(',')
                .filter(|a| !a.is_empty())
                .map(|a| decode(input, a))
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(scope) = segments.next() {
            url.scope = match scope.to_ascii_lowercase().as_str() {
                "" => None,
                "base" => Some(SearchScope::BaseObject),
                "one" => Some(SearchScope::SingleLevel),
                "sub" => Some(SearchScope::WholeSubtree),
                other => return Err(invalid(input, &format!("unknown scope {:?}", other))),
            };
        }
        if let Some(filter) = segments.next() {
            if !filter.is_empty() {
                url.filter = Some(decode(input, filter)?);
            }
        }
        if let Some(exts) = segments.next() {
            url.extensions = exts
                .split(',')
                .filter(|e| !e.is_empty())
                .map(|e| decode(input, e))
                .collect::<Result<Vec<_>>>()?;
        }
        if segments.next().is_some() {
            return Err(invalid(input, "too many '?' segments"));
        }
        Ok(url)
    }

    fn parse_hostport(input: &str, hostport: &str, scheme: Scheme) -> Result<(String, u16, bool)> {
        let (host, port_str, ipv6) = if let Some(stripped) = hostport.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(|| invalid(input, "unterminated IPv6 literal"))?;
            let literal = &stripped[..end];
            literal
                .parse::<Ipv6Addr>()
                .map_err(|_| invalid(input, "bad IPv6 literal"))?;
            let after = &stripped[end + 1..];
            let port = match after.strip_prefix(':') {
                Some(p) => Some(p),
                None if after.is_empty() => None,
                None => return Err(invalid(input, "garbage after IPv6 literal")),
            };
            (literal.to_string(), port, true)
        } else {
            match hostport.split_once(':') {
                Some((h, p)) => (h.to_string(), Some(p), false),
                None => (hostport.to_string(), None, false),
            }
        };
        if !ipv6 && !valid_hostname(&host) {
            return Err(invalid(input, &format!("bad hostname {:?}", host)));
        }
        let port = match port_str {
            Some(p) => {
                let port: u32 = p.parse().map_err(|_| invalid(input, "port is not a number"))?;
                if !(1..=65534).contains(&port) {
                    return Err(invalid(input, "port out of range"));
                }
                port as u16
            }
            None => scheme.default_port(),
        };
        Ok((host, port, ipv6))
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name, IPv6 literal (without brackets) or Unix socket path.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ipv6(&self) -> bool {
        self.ipv6
    }

    pub fn base_dn(&self) -> &DistinguishedName {
        &self.base_dn
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn scope(&self) -> Option<SearchScope> {
        self.scope
    }

    /// Numeric scope, -1 when the URL names none.
    pub fn scope_num(&self) -> i32 {
        self.scope.map(|s| s as i32).unwrap_or(-1)
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// `host:port` for TCP-based schemes, the socket path for ldapi.
    pub fn address(&self) -> String {
        match self.scheme {
            Scheme::Ldapi => self.host.clone(),
            _ if self.ipv6 => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn with_base_dn(mut self, base_dn: DistinguishedName) -> Self {
        self.base_dn = base_dn;
        self
    }
}

fn valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

impl fmt::Display for LdapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme.as_str())?;
        match self.scheme {
            Scheme::Ldapi => write!(f, "{}", utf8_percent_encode(&self.host, SOCKET_PCT_ENCODING_SET))?,
            _ if self.ipv6 => write!(f, "[{}]:{}", self.host, self.port)?,
            _ => write!(f, "{}:{}", self.host, self.port)?,
        }

        let scope = match self.scope {
            Some(SearchScope::BaseObject) => "base",
            Some(SearchScope::SingleLevel) => "one",
            Some(SearchScope::WholeSubtree) => "sub",
            None => "",
        };
        let attrs = self
            .attributes
            .iter()
            .map(|a| utf8_percent_encode(a, QUERY_PCT_ENCODING_SET).to_string())
            .collect::<Vec<_>>()
            .join(",");
        let filter = self
            .filter
            .as_deref()
            .map(|flt| utf8_percent_encode(flt, DN_PCT_ENCODING_SET).to_string())
            .unwrap_or_default();
        let exts = self
            .extensions
            .iter()
            .map(|e| utf8_percent_encode(e, QUERY_PCT_ENCODING_SET).to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut query = vec![attrs, scope.to_string(), filter, exts];
        while query.last().is_some_and(|s| s.is_empty()) {
            query.pop();
        }
        let dn = self.base_dn.to_string();
        if dn.is_empty() && query.is_empty() {
            return Ok(());
        }
        write!(f, "/{}", utf8_percent_encode(&dn, DN_PCT_ENCODING_SET))?;
        for part in query {
            write!(f, "?{}", part)?;
        }
        Ok(())
    }
}

/// Extensions are left out of equality.
impl PartialEq for LdapUrl {
    fn eq(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
            && self.base_dn == other.base_dn
            && self.scope == other.scope
            && self.filter == other.filter
            && self.attributes.len() == other.attributes.len()
            && self
                .attributes
                .iter()
                .zip(other.attributes.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Eq for LdapUrl {}

impl FromStr for LdapUrl {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
