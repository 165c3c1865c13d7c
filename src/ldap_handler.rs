use crate::directory::Directory;
use crate::dn::{Dn, Rdn};
use crate::entry::{Attribute, Entry, Modification};
use crate::error::{DirectoryError, DirectoryResult, ResultCode};
use crate::filter::Filter;
use crate::store::SearchScope;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const VENDOR_NAME: &str = "ldap-directory";
pub const VENDOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bind credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Simple(Vec<u8>),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: SearchScope,
    /// Maximum entries the client wants; 0 means no limit.
    pub size_limit: usize,
    /// Seconds; 0 means no limit.
    pub time_limit: u64,
    pub types_only: bool,
    pub filter: Filter,
    /// `*`, `+`, `1.1` or attribute names. Empty selects all user attributes.
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(base: &str, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base: base.to_string(),
            scope,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes: Vec::new(),
        }
    }
}

/// One operation from a client. DNs are carried as strings and parsed by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Bind {
        version: u8,
        name: String,
        authentication: Authentication,
    },
    Unbind,
    Add {
        dn: String,
        attributes: Vec<(String, Vec<Vec<u8>>)>,
    },
    Delete {
        dn: String,
    },
    Modify {
        dn: String,
        changes: Vec<Modification>,
    },
    ModifyDn {
        dn: String,
        new_rdn: String,
        delete_old_rdn: bool,
        new_superior: Option<String>,
    },
    Compare {
        dn: String,
        attribute: String,
        value: Vec<u8>,
    },
    Search(SearchRequest),
}

impl Request {
    /// Operation label used in logs and metrics.
    pub fn operation(&self) -> &'static str {
        match self {
            Request::Bind { .. } => "bind",
            Request::Unbind => "unbind",
            Request::Add { .. } => "add",
            Request::Delete { .. } => "delete",
            Request::Modify { .. } => "modify",
            Request::ModifyDn { .. } => "modifydn",
            Request::Compare { .. } => "compare",
            Request::Search(_) => "search",
        }
    }
}

/// A search result entry after attribute selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEntry {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    /// Search results; empty for every other operation.
    pub entries: Vec<ResultEntry>,
}

impl Response {
    pub fn success() -> Self {
        Self::with_code(ResultCode::Success)
    }

    pub fn with_code(result_code: ResultCode) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: String::new(),
            entries: Vec::new(),
        }
    }

    pub fn from_error(err: &DirectoryError) -> Self {
        Self {
            result_code: err.result_code(),
            matched_dn: err.matched_dn().unwrap_or_default().to_string(),
            diagnostic_message: err.to_string(),
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated(Dn),
    Closed,
}

/// One client's view of the directory.
///
/// Holds only the authentication state; every directory read and write goes
/// through the shared store.
pub struct Session {
    directory: Directory,
    state: SessionState,
}

impl Session {
    pub fn new(directory: Directory) -> Self {
        Self {
            directory,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn bound_dn(&self) -> Option<&Dn> {
        match &self.state {
            SessionState::Authenticated(dn) => Some(dn),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub async fn execute(&mut self, request: Request) -> Response {
        let op = request.operation();
        if self.is_closed() {
            return Response::from_error(&DirectoryError::Unavailable(
                "session is unbound".to_string(),
            ));
        }
        if self.directory.is_closed() {
            return Response::from_error(&DirectoryError::Unavailable(
                "directory is closed".to_string(),
            ));
        }
        let result = match request {
            Request::Bind {
                version,
                name,
                authentication,
            } => self.bind(version, &name, authentication).await,
            Request::Unbind => {
                debug!("Session unbound");
                self.state = SessionState::Closed;
                Ok(Response::success())
            }
            Request::Add { dn, attributes } => self.add(&dn, attributes).await,
            Request::Delete { dn } => self.delete(&dn).await,
            Request::Modify { dn, changes } => self.modify(&dn, &changes).await,
            Request::ModifyDn {
                dn,
                new_rdn,
                delete_old_rdn,
                new_superior,
            } => {
                self.modify_dn(&dn, &new_rdn, delete_old_rdn, new_superior.as_deref())
                    .await
            }
            Request::Compare {
                dn,
                attribute,
                value,
            } => self.compare(&dn, &attribute, &value).await,
            Request::Search(search) => self.search(search).await,
        };
        match result {
            Ok(response) => response,
            Err(e) => {
                debug!("{} failed: {}", op.to_uppercase(), e);
                Response::from_error(&e)
            }
        }
    }

    async fn bind(
        &mut self,
        version: u8,
        name: &str,
        authentication: Authentication,
    ) -> DirectoryResult<Response> {
        // Any bind attempt drops the previous identity.
        self.state = SessionState::Unauthenticated;
        if version != 3 {
            return Err(DirectoryError::Protocol(format!(
                "unsupported LDAP version {}",
                version
            )));
        }
        let password = match authentication {
            Authentication::Simple(password) => password,
            Authentication::Sasl { mechanism, .. } => {
                return Err(DirectoryError::AuthMethodNotSupported(mechanism))
            }
        };
        let config = self.directory.config();
        if name.is_empty() {
            if !password.is_empty() {
                return Err(DirectoryError::InvalidCredentials);
            }
            if !config.allow_anonymous_bind {
                warn!("Rejected anonymous bind");
                return Err(DirectoryError::InvalidCredentials);
            }
            debug!("Anonymous bind");
            return Ok(Response::success());
        }
        let dn = Dn::parse(name)?;
        if password.is_empty() {
            return Err(DirectoryError::UnwillingToPerform(
                "unauthenticated bind with a DN is not allowed".to_string(),
            ));
        }
        let authenticated = if &dn == self.directory.manager_dn() {
            password == config.manager_password.as_bytes()
        } else {
            match self.directory.store().lookup(&dn).await? {
                Some(entry) => entry
                    .values("userPassword")
                    .iter()
                    .any(|stored| *stored == password),
                None => false,
            }
        };
        if !authenticated {
            warn!("BIND failed for: {}", dn);
            return Err(DirectoryError::InvalidCredentials);
        }
        info!("BIND successful for: {}", dn);
        self.state = SessionState::Authenticated(dn);
        Ok(Response::success())
    }

    fn require_write(&self) -> DirectoryResult<()> {
        match self.state {
            SessionState::Authenticated(_) => Ok(()),
            _ => Err(DirectoryError::InsufficientAccess(
                "authentication required for updates".to_string(),
            )),
        }
    }

    fn require_read(&self) -> DirectoryResult<()> {
        match self.state {
            SessionState::Authenticated(_) => Ok(()),
            _ if self.directory.config().allow_anonymous_read => Ok(()),
            _ => Err(DirectoryError::InsufficientAccess(
                "anonymous read access is disabled".to_string(),
            )),
        }
    }

    async fn add(
        &self,
        dn: &str,
        attributes: Vec<(String, Vec<Vec<u8>>)>,
    ) -> DirectoryResult<Response> {
        self.require_write()?;
        let dn = Dn::parse(dn)?;
        let mut entry = Entry::new(dn);
        for (name, values) in attributes {
            if values.is_empty() {
                return Err(DirectoryError::Protocol(format!(
                    "attribute {} has no values",
                    name
                )));
            }
            for value in values {
                if !entry.add_value(&name, value) {
                    return Err(DirectoryError::AttributeOrValueExists(name));
                }
            }
        }
        self.directory.store().add(entry).await?;
        Ok(Response::success())
    }

    async fn delete(&self, dn: &str) -> DirectoryResult<Response> {
        self.require_write()?;
        let dn = Dn::parse(dn)?;
        self.directory.store().delete(&dn).await?;
        Ok(Response::success())
    }

    async fn modify(&self, dn: &str, changes: &[Modification]) -> DirectoryResult<Response> {
        self.require_write()?;
        let dn = Dn::parse(dn)?;
        self.directory.store().modify(&dn, changes).await?;
        Ok(Response::success())
    }

    async fn modify_dn(
        &self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> DirectoryResult<Response> {
        self.require_write()?;
        let dn = Dn::parse(dn)?;
        let new_rdn = Rdn::parse(new_rdn)?;
        let new_superior = new_superior.map(Dn::parse).transpose()?;
        self.directory
            .store()
            .modify_dn(&dn, &new_rdn, delete_old_rdn, new_superior.as_ref())
            .await?;
        Ok(Response::success())
    }

    async fn compare(&self, dn: &str, attribute: &str, value: &[u8]) -> DirectoryResult<Response> {
        self.require_read()?;
        let dn = Dn::parse(dn)?;
        let entry = self.directory.store().fetch(&dn).await?;
        let schema = self.directory.schema();
        let rule = schema.matching_rule(attribute);
        let mut present = false;
        let mut matched = false;
        for attr in entry
            .attributes()
            .filter(|a| schema.is_subtype_of(&a.name, attribute))
        {
            present = true;
            matched |= attr.values.iter().any(|v| rule.equal(v, value));
        }
        if !present {
            return Err(DirectoryError::NoSuchAttribute(attribute.to_string()));
        }
        Ok(Response::with_code(if matched {
            ResultCode::CompareTrue
        } else {
            ResultCode::CompareFalse
        }))
    }

    async fn search(&self, request: SearchRequest) -> DirectoryResult<Response> {
        let base = Dn::parse(&request.base)?;
        if base.is_root() && request.scope == SearchScope::BaseObject {
            return Ok(self.root_dse(&request));
        }
        self.require_read()?;

        let server_limit = self.directory.config().size_limit;
        let size_limit = match (request.size_limit, server_limit) {
            (0, limit) | (limit, 0) => limit,
            (a, b) => a.min(b),
        };
        let deadline = (request.time_limit > 0)
            .then(|| Instant::now() + Duration::from_secs(request.time_limit));

        let cursor = self
            .directory
            .store()
            .search(&base, request.scope, request.filter.clone())
            .await?;
        let response = self.collect_entries(cursor, &request, size_limit, || {
            deadline.is_some_and(|d| Instant::now() >= d)
        });
        debug!(
            "SEARCH base={} filter={} returned {} entries",
            base,
            request.filter,
            response.entries.len()
        );
        Ok(response)
    }

    /// Drain search results until the size limit is hit or `expired` reports
    /// the time limit has passed.
    fn collect_entries<I, F>(
        &self,
        entries: I,
        request: &SearchRequest,
        size_limit: usize,
        mut expired: F,
    ) -> Response
    where
        I: IntoIterator<Item = Entry>,
        F: FnMut() -> bool,
    {
        let mut response = Response::success();
        for entry in entries {
            if expired() {
                response.result_code = ResultCode::TimeLimitExceeded;
                response.diagnostic_message = DirectoryError::TimeLimitExceeded.to_string();
                break;
            }
            if size_limit > 0 && response.entries.len() >= size_limit {
                response.result_code = ResultCode::SizeLimitExceeded;
                response.diagnostic_message = DirectoryError::SizeLimitExceeded.to_string();
                break;
            }
            response.entries.push(self.select(&entry, request));
        }
        response
    }

    /// Apply the requested attribute list and typesOnly.
    fn select(&self, entry: &Entry, request: &SearchRequest) -> ResultEntry {
        let schema = self.directory.schema();
        let requested = &request.attributes;
        let no_attrs = requested.len() == 1 && requested[0] == "1.1";
        let all_user = requested.is_empty() || requested.iter().any(|a| a == "*");
        let all_operational = requested.iter().any(|a| a == "+");
        let attributes = entry
            .attributes()
            .filter(|attr| {
                if no_attrs {
                    return false;
                }
                let operational = schema.is_operational(&attr.name);
                (all_user && !operational)
                    || (all_operational && operational)
                    || requested
                        .iter()
                        .any(|r| schema.is_subtype_of(&attr.name, r))
            })
            .map(|attr| Attribute {
                name: attr.name.clone(),
                values: if request.types_only {
                    Vec::new()
                } else {
                    attr.values.clone()
                },
            })
            .collect();
        ResultEntry {
            dn: entry.dn().to_string(),
            attributes,
        }
    }

    fn root_dse(&self, request: &SearchRequest) -> Response {
        let contexts: Vec<String> = self
            .directory
            .store()
            .naming_contexts()
            .iter()
            .map(|dn| dn.to_string())
            .collect();
        let dse = Entry::new(Dn::root())
            .with_attribute("objectClass", ["top"])
            .with_attribute("namingContexts", &contexts)
            .with_attribute("supportedLDAPVersion", ["3"])
            .with_attribute("vendorName", [VENDOR_NAME])
            .with_attribute("vendorVersion", [VENDOR_VERSION]);
        let mut response = Response::success();
        if request.filter.matches(&dse, self.directory.schema()) {
            let mut all = request.clone();
            if all.attributes.is_empty() {
                all.attributes.push("+".to_string());
                all.attributes.push("*".to_string());
            }
            response.entries.push(self.select(&dse, &all));
        }
        response
    }
}
