pub mod blocking;
pub mod client;
pub mod config;
pub mod connection;
pub mod controls;
pub mod dn;
pub mod entry;
pub mod error;
pub mod filter;
pub mod ldap_protocol;
pub mod logging;
pub mod pool;
pub mod sasl;
pub mod search;
pub mod tls;
pub mod transport;
pub mod url;
pub mod value_list;

pub use blocking::{BlockingConnection, BlockingSearch};
pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, PoolConfig};
pub use connection::{Connection, ConnectionState, OpHandle, Response, SearchStream};
pub use controls::{PasswordPolicyInfo, SortKey};
pub use dn::DistinguishedName;
pub use entry::{Entry, ModifyOp};
pub use error::{LdapError, PasswordPolicyKind, PoolError, Result};
pub use filter::{Filter, ldap_escape};
pub use pool::{CooperativeGuard, CooperativePool, PoolGuard, Pooled, SharedPool};
pub use sasl::{Credentials, Mechanism, SecurityProperties};
pub use search::{DerefAliases, ReferralPolicy, SearchItem, SearchParams, SearchResult, SearchScope, VlvParams};
pub use tls::CertPolicy;
pub use url::LdapUrl;
pub use value_list::{AttrValue, ValueList};
