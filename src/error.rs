//! Error taxonomy for the client: LDAP result codes, transport failures,
//! password-policy failures and client misuse.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LdapError>;

/// LDAP result codes the client maps to dedicated variants (RFC 4511 §4.1.9).
pub mod rc {
    pub const SUCCESS: i32 = 0x00;
    pub const OPERATIONS_ERROR: i32 = 0x01;
    pub const PROTOCOL_ERROR: i32 = 0x02;
    pub const TIME_LIMIT_EXCEEDED: i32 = 0x03;
    pub const SIZE_LIMIT_EXCEEDED: i32 = 0x04;
    pub const COMPARE_FALSE: i32 = 0x05;
    pub const COMPARE_TRUE: i32 = 0x06;
    pub const AUTH_METHOD_NOT_SUPPORTED: i32 = 0x07;
    pub const REFERRAL: i32 = 0x0A;
    pub const SASL_BIND_IN_PROGRESS: i32 = 0x0E;
    pub const NO_SUCH_ATTRIBUTE: i32 = 0x10;
    pub const TYPE_OR_VALUE_EXISTS: i32 = 0x14;
    pub const NO_SUCH_OBJECT: i32 = 0x20;
    pub const INVALID_DN_SYNTAX: i32 = 0x22;
    pub const INVALID_CREDENTIALS: i32 = 0x31;
    pub const INSUFFICIENT_ACCESS: i32 = 0x32;
    pub const UNWILLING_TO_PERFORM: i32 = 0x35;
    pub const OBJECT_CLASS_VIOLATION: i32 = 0x41;
    pub const NOT_ALLOWED_ON_NONLEAF: i32 = 0x42;
    pub const ENTRY_ALREADY_EXISTS: i32 = 0x44;
    pub const AFFECTS_MULTIPLE_DSAS: i32 = 0x47;
    pub const SERVER_DOWN: i32 = 0x51;

    pub const CONNECTION_DOWN: i32 = -1;
    pub const TIMEOUT: i32 = -5;
    pub const CONNECTION_ERROR: i32 = -11;
    pub const INVALID_MESSAGE_ID: i32 = -100;
    pub const CLOSED_CONNECTION: i32 = -101;
}

/// Password policy failures (draft-behera-ldap-password-policy), surfaced
/// with client-side codes -200..=-208.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordPolicyKind {
    Expired,
    AccountLocked,
    ChangeAfterReset,
    ModNotAllowed,
    MustSupplyOld,
    QualityInsufficient,
    TooShort,
    TooYoung,
    InHistory,
}

impl PasswordPolicyKind {
    /// Map the ppolicy response `error` ENUMERATED value.
    pub fn from_ppolicy_error(value: u8) -> Option<Self> {
        Some(match value {
            0 => PasswordPolicyKind::Expired,
            1 => PasswordPolicyKind::AccountLocked,
            2 => PasswordPolicyKind::ChangeAfterReset,
            3 => PasswordPolicyKind::ModNotAllowed,
            4 => PasswordPolicyKind::MustSupplyOld,
            5 => PasswordPolicyKind::QualityInsufficient,
            6 => PasswordPolicyKind::TooShort,
            7 => PasswordPolicyKind::TooYoung,
            8 => PasswordPolicyKind::InHistory,
            _ => return None,
        })
    }

    /// Inverse of `from_ppolicy_error`.
    pub fn ppolicy_error(self) -> u8 {
        self as u8
    }

    pub fn code(self) -> i32 {
        -200 - self as i32
    }

    fn describe(self) -> &'static str {
        match self {
            PasswordPolicyKind::Expired => "password expired",
            PasswordPolicyKind::AccountLocked => "account locked",
            PasswordPolicyKind::ChangeAfterReset => "password must be changed after reset",
            PasswordPolicyKind::ModNotAllowed => "password modification not allowed",
            PasswordPolicyKind::MustSupplyOld => "old password must be supplied",
            PasswordPolicyKind::QualityInsufficient => "password quality insufficient",
            PasswordPolicyKind::TooShort => "password too short",
            PasswordPolicyKind::TooYoung => "password too young to modify",
            PasswordPolicyKind::InHistory => "password in history",
        }
    }
}

impl fmt::Display for PasswordPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("the pool is closed")]
    Closed,
    #[error("no connection is available in the pool")]
    Empty,
    #[error("connection is not managed by this pool")]
    Foreign,
    #[error("invalid pool size: minconn={minconn}, maxconn={maxconn}")]
    InvalidSize { minconn: usize, maxconn: usize },
}

#[derive(Debug, Clone, Error)]
pub enum LdapError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("size limit exceeded: {0}")]
    SizeLimitExceeded(String),
    #[error("authentication method not supported: {0}")]
    AuthMethodNotSupported(String),
    #[error("referral: {message}")]
    Referral { message: String, urls: Vec<String> },
    #[error("no such attribute: {0}")]
    NoSuchAttribute(String),
    #[error("type or value exists: {0}")]
    TypeOrValueExists(String),
    #[error("no such object: {0}")]
    NoSuchObject(String),
    #[error("invalid DN: {0}")]
    InvalidDn(String),
    #[error("authentication failed: {0}")]
    AuthenticationError(String),
    #[error("insufficient access: {0}")]
    InsufficientAccess(String),
    #[error("unwilling to perform: {0}")]
    UnwillingToPerform(String),
    #[error("object class violation: {0}")]
    ObjectClassViolation(String),
    #[error("not allowed on non-leaf: {0}")]
    NotAllowedOnNonleaf(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("affects multiple DSAs: {0}")]
    AffectsMultipleDsa(String),
    #[error("{kind}: {message}")]
    PasswordPolicy { kind: PasswordPolicyKind, message: String },
    #[error("connection down: {0}")]
    ConnectionDown(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("invalid message ID: {0}")]
    InvalidMessageId(i32),
    #[error("the connection is closed")]
    ClosedConnection,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("SASL error: {0}")]
    Sasl(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("LDAP error 0x{code:02X}: {message}")]
    Other { code: i32, message: String },
}

impl LdapError {
    /// Translate a non-success LDAP result into a typed error. The server's
    /// diagnostic message is kept verbatim.
    pub fn from_result_code(code: i32, message: &str, referrals: &[String]) -> Self {
        let message = message.to_string();
        match code {
            rc::PROTOCOL_ERROR => LdapError::Protocol(message),
            rc::SIZE_LIMIT_EXCEEDED => LdapError::SizeLimitExceeded(message),
            rc::AUTH_METHOD_NOT_SUPPORTED => LdapError::AuthMethodNotSupported(message),
            rc::REFERRAL => LdapError::Referral {
                message,
                urls: referrals.to_vec(),
            },
            rc::NO_SUCH_ATTRIBUTE => LdapError::NoSuchAttribute(message),
            rc::TYPE_OR_VALUE_EXISTS => LdapError::TypeOrValueExists(message),
            rc::NO_SUCH_OBJECT => LdapError::NoSuchObject(message),
            rc::INVALID_DN_SYNTAX => LdapError::InvalidDn(message),
            rc::INVALID_CREDENTIALS => LdapError::AuthenticationError(message),
            rc::INSUFFICIENT_ACCESS => LdapError::InsufficientAccess(message),
            rc::UNWILLING_TO_PERFORM => LdapError::UnwillingToPerform(message),
            rc::OBJECT_CLASS_VIOLATION => LdapError::ObjectClassViolation(message),
            rc::NOT_ALLOWED_ON_NONLEAF => LdapError::NotAllowedOnNonleaf(message),
            rc::ENTRY_ALREADY_EXISTS => LdapError::AlreadyExists(message),
            rc::AFFECTS_MULTIPLE_DSAS => LdapError::AffectsMultipleDsa(message),
            rc::SERVER_DOWN | rc::CONNECTION_DOWN => LdapError::ConnectionDown(message),
            rc::TIMEOUT => LdapError::Timeout(message),
            rc::CONNECTION_ERROR => LdapError::ConnectionError(message),
            rc::CLOSED_CONNECTION => LdapError::ClosedConnection,
            code if (-208..=-200).contains(&code) => {
                match PasswordPolicyKind::from_ppolicy_error((-200 - code) as u8) {
                    Some(kind) => LdapError::PasswordPolicy { kind, message },
                    None => LdapError::Other { code, message },
                }
            }
            code => LdapError::Other { code, message },
        }
    }

    pub fn password_policy(kind: PasswordPolicyKind, message: &str) -> Self {
        LdapError::PasswordPolicy {
            kind,
            message: message.to_string(),
        }
    }

    /// Numeric LDAP result code, or the client-side negative code.
    pub fn code(&self) -> i32 {
        match self {
            LdapError::Protocol(_) => rc::PROTOCOL_ERROR,
            LdapError::SizeLimitExceeded(_) => rc::SIZE_LIMIT_EXCEEDED,
            LdapError::AuthMethodNotSupported(_) => rc::AUTH_METHOD_NOT_SUPPORTED,
            LdapError::Referral { .. } => rc::REFERRAL,
            LdapError::NoSuchAttribute(_) => rc::NO_SUCH_ATTRIBUTE,
            LdapError::TypeOrValueExists(_) => rc::TYPE_OR_VALUE_EXISTS,
            LdapError::NoSuchObject(_) => rc::NO_SUCH_OBJECT,
            LdapError::InvalidDn(_) => rc::INVALID_DN_SYNTAX,
            LdapError::AuthenticationError(_) => rc::INVALID_CREDENTIALS,
            LdapError::InsufficientAccess(_) => rc::INSUFFICIENT_ACCESS,
            LdapError::UnwillingToPerform(_) => rc::UNWILLING_TO_PERFORM,
            LdapError::ObjectClassViolation(_) => rc::OBJECT_CLASS_VIOLATION,
            LdapError::NotAllowedOnNonleaf(_) => rc::NOT_ALLOWED_ON_NONLEAF,
            LdapError::AlreadyExists(_) => rc::ENTRY_ALREADY_EXISTS,
            LdapError::AffectsMultipleDsa(_) => rc::AFFECTS_MULTIPLE_DSAS,
            LdapError::PasswordPolicy { kind, .. } => kind.code(),
            LdapError::ConnectionDown(_) => rc::CONNECTION_DOWN,
            LdapError::Timeout(_) => rc::TIMEOUT,
            LdapError::ConnectionError(_) | LdapError::Tls(_) => rc::CONNECTION_ERROR,
            LdapError::InvalidMessageId(_) => rc::INVALID_MESSAGE_ID,
            LdapError::ClosedConnection => rc::CLOSED_CONNECTION,
            LdapError::Sasl(_) => rc::INVALID_CREDENTIALS,
            LdapError::InvalidArgument(_) | LdapError::Config(_) | LdapError::Pool(_) => {
                rc::OPERATIONS_ERROR
            }
            LdapError::Other { code, .. } => *code,
        }
    }

    /// The code as a 16-bit hexadecimal string, e.g. `0x0020` or `0xFF9B`.
    pub fn hex_code(&self) -> String {
        format!("0x{:04X}", self.code() as u16)
    }

    /// Human readable message; the server diagnostic when one was sent.
    pub fn message(&self) -> String {
        match self {
            LdapError::Protocol(m)
            | LdapError::SizeLimitExceeded(m)
            | LdapError::AuthMethodNotSupported(m)
            | LdapError::NoSuchAttribute(m)
            | LdapError::TypeOrValueExists(m)
            | LdapError::NoSuchObject(m)
            | LdapError::InvalidDn(m)
            | LdapError::AuthenticationError(m)
            | LdapError::InsufficientAccess(m)
            | LdapError::UnwillingToPerform(m)
            | LdapError::ObjectClassViolation(m)
            | LdapError::NotAllowedOnNonleaf(m)
            | LdapError::AlreadyExists(m)
            | LdapError::AffectsMultipleDsa(m)
            | LdapError::ConnectionDown(m)
            | LdapError::Timeout(m)
            | LdapError::ConnectionError(m)
            | LdapError::InvalidArgument(m)
            | LdapError::Config(m)
            | LdapError::Tls(m)
            | LdapError::Sasl(m) => m.clone(),
            LdapError::Referral { message, .. }
            | LdapError::PasswordPolicy { message, .. }
            | LdapError::Other { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// True for credential failures, including the password-policy kinds
    /// that reject a bind.
    pub fn is_authentication(&self) -> bool {
        match self {
            LdapError::AuthenticationError(_) => true,
            LdapError::PasswordPolicy { kind, .. } => matches!(
                kind,
                PasswordPolicyKind::Expired
                    | PasswordPolicyKind::AccountLocked
                    | PasswordPolicyKind::ChangeAfterReset
            ),
            _ => false,
        }
    }

    pub fn is_password_policy(&self) -> bool {
        matches!(self, LdapError::PasswordPolicy { .. })
    }

    /// Transport-level errors invalidate the connection; everything else
    /// leaves it usable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LdapError::ConnectionDown(_)
                | LdapError::ClosedConnection
                | LdapError::ConnectionError(_)
                | LdapError::Timeout(_)
                | LdapError::Tls(_)
        )
    }
}

impl From<std::io::Error> for LdapError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionAborted => LdapError::ConnectionDown(err.to_string()),
            std::io::ErrorKind::TimedOut => LdapError::Timeout(err.to_string()),
            _ => LdapError::ConnectionError(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for LdapError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        LdapError::Timeout(err.to_string())
    }
}
