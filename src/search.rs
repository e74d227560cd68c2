//! Search parameters, VLV arguments and result items.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controls::{self, PagedResults, SortKey, SortResult, VlvRequest, VlvResult, VlvTarget};
use crate::dn::DistinguishedName;
use crate::entry::Entry;
use crate::error::{LdapError, Result};
use crate::filter::Filter;
use crate::ldap_protocol::{Control, SearchRequest};
pub use crate::ldap_protocol::SearchScope;
use crate::url::LdapUrl;

/// Numeric scope used when a URL leaves the scope out.
pub const UNDEFINED_SCOPE: i32 = -1;

impl SearchScope {
    /// `-1` is the undefined-scope sentinel and maps to `None`; it is
    /// rejected when a request is built.
    pub fn from_i32(value: i32) -> Result<Option<Self>> {
        match value {
            UNDEFINED_SCOPE => Ok(None),
            0 => Ok(Some(SearchScope::BaseObject)),
            1 => Ok(Some(SearchScope::SingleLevel)),
            2 => Ok(Some(SearchScope::WholeSubtree)),
            other => Err(LdapError::InvalidArgument(format!("invalid search scope: {}", other))),
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerefAliases {
    #[default]
    Never = 0,
    InSearching = 1,
    FindingBaseObject = 2,
    Always = 3,
}

/// How search references and referral results are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferralPolicy {
    /// The server resolves referrals; stray references are dropped.
    #[default]
    ServerSide,
    /// Follow each reference on a fresh connection and merge the entries.
    ClientSide,
    /// Hand references to the caller as [`SearchItem::Reference`].
    Yield,
    /// Drop references silently.
    Drop,
}

impl ReferralPolicy {
    pub fn from_flags(server_chase: bool, ignore: bool, client_chase: bool) -> Self {
        if ignore {
            ReferralPolicy::Drop
        } else if server_chase {
            ReferralPolicy::ServerSide
        } else if client_chase {
            ReferralPolicy::ClientSide
        } else {
            ReferralPolicy::Yield
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub base: String,
    pub scope: Option<SearchScope>,
    pub filter: String,
    pub attrlist: Vec<String>,
    pub attrsonly: bool,
    pub timeout: Option<Duration>,
    pub sizelimit: i32,
    pub deref: DerefAliases,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            base: String::new(),
            scope: Some(SearchScope::WholeSubtree),
            filter: "(objectClass=*)".to_string(),
            attrlist: Vec::new(),
            attrsonly: false,
            timeout: None,
            sizelimit: 0,
            deref: DerefAliases::Never,
        }
    }
}

impl SearchParams {
    pub fn new(base: &str, scope: SearchScope, filter: &str) -> Self {
        Self {
            base: base.to_string(),
            scope: Some(scope),
            filter: filter.to_string(),
            ..Default::default()
        }
    }

    /// Parameters taken from an LDAP URL; an absent scope stays undefined.
    pub fn from_url(url: &LdapUrl) -> Self {
        Self {
            base: url.base_dn().to_string(),
            scope: url.scope(),
            filter: url.filter().unwrap_or("(objectClass=*)").to_string(),
            attrlist: url.attributes().to_vec(),
            ..Default::default()
        }
    }

    pub fn attrs<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attrlist = attrs.into_iter().map(Into::into).collect();
        self
    }

    pub fn attrsonly(mut self, attrsonly: bool) -> Self {
        self.attrsonly = attrsonly;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn sizelimit(mut self, sizelimit: i32) -> Self {
        self.sizelimit = sizelimit;
        self
    }

    pub fn deref(mut self, deref: DerefAliases) -> Self {
        self.deref = deref;
        self
    }

    /// Build the wire request, validating base DN, scope and filter.
    pub fn to_request(&self) -> Result<SearchRequest> {
        let scope = self.scope.ok_or_else(|| {
            LdapError::InvalidArgument(format!("search scope is undefined ({})", UNDEFINED_SCOPE))
        })?;
        let base = DistinguishedName::parse(&self.base)?;
        let filter = Filter::parse(&self.filter)?;
        if self.sizelimit < 0 {
            return Err(LdapError::InvalidArgument(format!("negative size limit: {}", self.sizelimit)));
        }
        // Round up so a sub-second timeout still limits the server.
        let time_limit = self
            .timeout
            .map(|t| {
                i32::try_from(t.as_secs())
                    .unwrap_or(i32::MAX)
                    .saturating_add(i32::from(t.subsec_nanos() > 0))
            })
            .unwrap_or(0);
        Ok(SearchRequest {
            base_object: base.to_string(),
            scope,
            deref_aliases: self.deref as i32,
            size_limit: self.sizelimit,
            time_limit,
            types_only: self.attrsonly,
            filter,
            attributes: self.attrlist.clone(),
        })
    }
}

/// Virtual list view window. Either `offset` or `attrvalue` picks the target.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VlvParams {
    pub before_count: i32,
    pub after_count: i32,
    pub offset: Option<i32>,
    pub attrvalue: Option<String>,
    pub est_list_count: i32,
    pub context_id: Option<Vec<u8>>,
    pub sort_order: Vec<SortKey>,
}

impl VlvParams {
    pub fn by_offset(offset: i32, before_count: i32, after_count: i32, est_list_count: i32) -> Self {
        Self {
            before_count,
            after_count,
            offset: Some(offset),
            est_list_count,
            ..Default::default()
        }
    }

    pub fn by_value(attrvalue: &str, before_count: i32, after_count: i32) -> Self {
        Self {
            before_count,
            after_count,
            attrvalue: Some(attrvalue.to_string()),
            ..Default::default()
        }
    }

    /// Sort keys such as `"-uidNumber"` (leading `-` reverses).
    pub fn sort<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.sort_order = keys.into_iter().map(|k| SortKey::new(k.as_ref())).collect();
        self
    }

    pub fn to_control(&self) -> Result<VlvRequest> {
        let target = match (&self.attrvalue, self.offset) {
            (Some(value), None) => VlvTarget::GreaterOrEqual(value.as_bytes().to_vec()),
            (None, Some(offset)) => VlvTarget::ByOffset {
                offset,
                content_count: self.est_list_count,
            },
            _ => {
                return Err(LdapError::InvalidArgument(
                    "VLV needs exactly one of offset or attrvalue".to_string(),
                ));
            }
        };
        if self.before_count < 0 || self.after_count < 0 {
            return Err(LdapError::InvalidArgument("VLV counts must not be negative".to_string()));
        }
        Ok(VlvRequest {
            before_count: self.before_count,
            after_count: self.after_count,
            target,
            context_id: self.context_id.clone(),
        })
    }
}

/// One element of a search result sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchItem {
    Entry(Entry),
    Reference(Vec<String>),
}

impl SearchItem {
    pub fn as_entry(&self) -> Option<&Entry> {
        match self {
            SearchItem::Entry(e) => Some(e),
            SearchItem::Reference(_) => None,
        }
    }

    pub fn into_entry(self) -> Option<Entry> {
        match self {
            SearchItem::Entry(e) => Some(e),
            SearchItem::Reference(_) => None,
        }
    }
}

/// A completed search: the items in arrival order plus the response controls
/// of the final `SearchResultDone`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResult {
    pub items: Vec<SearchItem>,
    pub controls: Vec<Control>,
}

impl SearchResult {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.items.iter().filter_map(SearchItem::as_entry)
    }

    pub fn into_entries(self) -> Vec<Entry> {
        self.items.into_iter().filter_map(SearchItem::into_entry).collect()
    }

    pub fn references(&self) -> impl Iterator<Item = &[String]> {
        self.items.iter().filter_map(|item| match item {
            SearchItem::Reference(urls) => Some(urls.as_slice()),
            SearchItem::Entry(_) => None,
        })
    }

    pub fn vlv_result(&self) -> Option<VlvResult> {
        controls::find(&self.controls, controls::VLV_RESPONSE_OID)
            .and_then(|c| c.value.as_deref())
            .and_then(|v| VlvResult::parse(v).ok())
    }

    pub fn sort_result(&self) -> Option<SortResult> {
        controls::find(&self.controls, controls::SORT_RESPONSE_OID)
            .and_then(|c| c.value.as_deref())
            .and_then(|v| SortResult::parse(v).ok())
    }

    /// Paged-results cookie; `None` or empty means the last page.
    pub fn page_cookie(&self) -> Option<Vec<u8>> {
        controls::find(&self.controls, controls::PAGED_RESULTS_OID)
            .and_then(|c| c.value.as_deref())
            .and_then(|v| PagedResults::parse(v).ok())
            .map(|p| p.cookie)
    }
}

impl IntoIterator for SearchResult {
    type Item = SearchItem;
    type IntoIter = std::vec::IntoIter<SearchItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
