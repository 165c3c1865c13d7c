//! Directory errors and their LDAP result codes (RFC 4511 section 4.1.9).

use thiserror::Error;

/// LDAP result codes produced by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    CompareFalse = 5,
    CompareTrue = 6,
    AuthMethodNotSupported = 7,
    UnavailableCriticalExtension = 12,
    NoSuchAttribute = 16,
    UndefinedAttributeType = 17,
    ConstraintViolation = 19,
    AttributeOrValueExists = 20,
    InvalidAttributeSyntax = 21,
    NoSuchObject = 32,
    InvalidDnSyntax = 34,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    NamingViolation = 64,
    ObjectClassViolation = 65,
    NotAllowedOnNonLeaf = 66,
    NotAllowedOnRdn = 67,
    EntryAlreadyExists = 68,
    Other = 80,
}

impl ResultCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Label used in logs and metrics.
    pub fn name(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::OperationsError => "operationsError",
            ResultCode::ProtocolError => "protocolError",
            ResultCode::TimeLimitExceeded => "timeLimitExceeded",
            ResultCode::SizeLimitExceeded => "sizeLimitExceeded",
            ResultCode::CompareFalse => "compareFalse",
            ResultCode::CompareTrue => "compareTrue",
            ResultCode::AuthMethodNotSupported => "authMethodNotSupported",
            ResultCode::UnavailableCriticalExtension => "unavailableCriticalExtension",
            ResultCode::NoSuchAttribute => "noSuchAttribute",
            ResultCode::UndefinedAttributeType => "undefinedAttributeType",
            ResultCode::ConstraintViolation => "constraintViolation",
            ResultCode::AttributeOrValueExists => "attributeOrValueExists",
            ResultCode::InvalidAttributeSyntax => "invalidAttributeSyntax",
            ResultCode::NoSuchObject => "noSuchObject",
            ResultCode::InvalidDnSyntax => "invalidDNSyntax",
            ResultCode::InvalidCredentials => "invalidCredentials",
            ResultCode::InsufficientAccessRights => "insufficientAccessRights",
            ResultCode::Busy => "busy",
            ResultCode::Unavailable => "unavailable",
            ResultCode::UnwillingToPerform => "unwillingToPerform",
            ResultCode::NamingViolation => "namingViolation",
            ResultCode::ObjectClassViolation => "objectClassViolation",
            ResultCode::NotAllowedOnNonLeaf => "notAllowedOnNonLeaf",
            ResultCode::NotAllowedOnRdn => "notAllowedOnRDN",
            ResultCode::EntryAlreadyExists => "entryAlreadyExists",
            ResultCode::Other => "other",
        }
    }

    /// Compare results are not failures.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ResultCode::Success | ResultCode::CompareTrue | ResultCode::CompareFalse
        )
    }
}

/// Errors raised by the directory core.
///
/// Messages are returned to clients as the diagnostic message, so they must not
/// carry credentials.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// Malformed distinguished name.
    #[error("invalid DN: {0}")]
    InvalidDn(String),

    /// Malformed search filter.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Malformed LDIF record.
    #[error("LDIF error at line {line}: {message}")]
    Ldif { line: usize, message: String },

    /// Malformed schema definition.
    #[error("schema error: {0}")]
    Schema(String),

    /// Two schema sources define the same name differently.
    #[error("conflicting schema definition: {0}")]
    SchemaConflict(String),

    #[error("undefined attribute type: {0}")]
    UndefinedAttributeType(String),

    #[error("object class violation: {0}")]
    ObjectClassViolation(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("invalid attribute syntax: {0}")]
    InvalidAttributeSyntax(String),

    /// Entry does not exist. `matched` is the deepest existing ancestor.
    #[error("no such object: {dn}")]
    NoSuchObject { dn: String, matched: Option<String> },

    #[error("entry already exists: {0}")]
    EntryAlreadyExists(String),

    #[error("entry has subordinates: {0}")]
    NotAllowedOnNonLeaf(String),

    #[error("no such attribute: {0}")]
    NoSuchAttribute(String),

    #[error("attribute or value exists: {0}")]
    AttributeOrValueExists(String),

    #[error("not allowed on RDN: {0}")]
    NotAllowedOnRdn(String),

    #[error("naming violation: {0}")]
    NamingViolation(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("insufficient access rights: {0}")]
    InsufficientAccess(String),

    /// Store lock could not be acquired in time; the request may be retried.
    #[error("directory busy, retry later")]
    Busy,

    /// Directory closed or session unbound.
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("unwilling to perform: {0}")]
    UnwillingToPerform(String),

    #[error("size limit exceeded")]
    SizeLimitExceeded,

    #[error("time limit exceeded")]
    TimeLimitExceeded,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication method not supported: {0}")]
    AuthMethodNotSupported(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl DirectoryError {
    pub fn no_such_object(dn: impl Into<String>, matched: Option<String>) -> Self {
        DirectoryError::NoSuchObject {
            dn: dn.into(),
            matched,
        }
    }

    pub fn result_code(&self) -> ResultCode {
        match self {
            DirectoryError::InvalidDn(_) => ResultCode::InvalidDnSyntax,
            DirectoryError::InvalidFilter(_) => ResultCode::ProtocolError,
            DirectoryError::Ldif { .. } => ResultCode::Other,
            DirectoryError::Schema(_) => ResultCode::Other,
            DirectoryError::SchemaConflict(_) => ResultCode::Other,
            DirectoryError::UndefinedAttributeType(_) => ResultCode::UndefinedAttributeType,
            DirectoryError::ObjectClassViolation(_) => ResultCode::ObjectClassViolation,
            DirectoryError::ConstraintViolation(_) => ResultCode::ConstraintViolation,
            DirectoryError::InvalidAttributeSyntax(_) => ResultCode::InvalidAttributeSyntax,
            DirectoryError::NoSuchObject { .. } => ResultCode::NoSuchObject,
            DirectoryError::EntryAlreadyExists(_) => ResultCode::EntryAlreadyExists,
            DirectoryError::NotAllowedOnNonLeaf(_) => ResultCode::NotAllowedOnNonLeaf,
            DirectoryError::NoSuchAttribute(_) => ResultCode::NoSuchAttribute,
            DirectoryError::AttributeOrValueExists(_) => ResultCode::AttributeOrValueExists,
            DirectoryError::NotAllowedOnRdn(_) => ResultCode::NotAllowedOnRdn,
            DirectoryError::NamingViolation(_) => ResultCode::NamingViolation,
            DirectoryError::InvalidCredentials => ResultCode::InvalidCredentials,
            DirectoryError::InsufficientAccess(_) => ResultCode::InsufficientAccessRights,
            DirectoryError::Busy => ResultCode::Busy,
            DirectoryError::Unavailable(_) => ResultCode::Unavailable,
            DirectoryError::UnwillingToPerform(_) => ResultCode::UnwillingToPerform,
            DirectoryError::SizeLimitExceeded => ResultCode::SizeLimitExceeded,
            DirectoryError::TimeLimitExceeded => ResultCode::TimeLimitExceeded,
            DirectoryError::Protocol(_) => ResultCode::ProtocolError,
            DirectoryError::AuthMethodNotSupported(_) => ResultCode::AuthMethodNotSupported,
            DirectoryError::Io(_) => ResultCode::Other,
        }
    }

    /// Matched DN reported alongside `noSuchObject`.
    pub fn matched_dn(&self) -> Option<&str> {
        match self {
            DirectoryError::NoSuchObject { matched, .. } => matched.as_deref(),
            _ => None,
        }
    }

    /// Schema violations reject the operation and leave the store unchanged.
    pub fn is_schema_violation(&self) -> bool {
        matches!(
            self,
            DirectoryError::UndefinedAttributeType(_)
                | DirectoryError::ObjectClassViolation(_)
                | DirectoryError::ConstraintViolation(_)
                | DirectoryError::InvalidAttributeSyntax(_)
        )
    }
}

impl From<std::io::Error> for DirectoryError {
    fn from(err: std::io::Error) -> Self {
        DirectoryError::Io(err.to_string())
    }
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;
