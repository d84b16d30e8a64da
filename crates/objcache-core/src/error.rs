//! Error types for object cache and commit operations.

use std::fmt;

/// The primary error type for all objcache operations.
#[derive(Debug)]
pub enum Error {
    /// A new record still lacks a required key component at commit time
    MissingPrimaryKey(MissingPrimaryKeyError),
    /// An UPDATE affected zero rows
    MissingObject(MissingObjectError),
    /// A record was observed in an impossible state combination
    UnsupportedState(StateError),
    /// An insert retry round made no progress
    UnresolvedDependencies(DependencyError),
    /// Metadata/configuration errors (unsupported key type, bad descriptor)
    Config(ConfigError),
    /// Key component of the wrong kind
    Type(TypeError),
    /// Store command failures
    Query(QueryError),
    /// One or more acquisitions failed to release
    Acquisition(AcquisitionError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct MissingPrimaryKeyError {
    pub type_name: String,
    /// Description of the offending record.
    pub record: String,
}

#[derive(Debug)]
pub struct MissingObjectError {
    pub type_name: String,
    pub record: String,
    /// The statement that touched no rows, when the surface reports one.
    pub sql: Option<String>,
}

#[derive(Debug)]
pub struct StateError {
    pub message: String,
    pub record: Option<String>,
}

#[derive(Debug)]
pub struct DependencyError {
    /// Insert round (1-based) that made no progress.
    pub round: usize,
    /// Records that could not be inserted.
    pub records: Vec<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub type_name: Option<String>,
    pub record: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Other database error
    Database,
}

/// Release failures collected after every acquisition had a chance to release.
#[derive(Debug)]
pub struct AcquisitionError {
    /// Every release failure, in acquisition order.
    pub failures: Vec<Error>,
    /// The commit error that preceded the releases, if any.
    pub cause: Option<Box<Error>>,
}

impl AcquisitionError {
    /// The first release failure.
    pub fn first(&self) -> Option<&Error> {
        self.failures.first()
    }
}

impl QueryError {
    /// Create a database error with just a message.
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            type_name: None,
            record: None,
            message: message.into(),
            source: None,
        }
    }

    /// Is this a foreign key or unique violation?
    pub fn is_constraint_violation(&self) -> bool {
        self.kind == QueryErrorKind::Constraint
    }
}

impl Error {
    /// Attach statement diagnostics to a store error.
    ///
    /// Only `Query` errors carry diagnostics; every other error is returned
    /// unchanged. Diagnostics already present are kept.
    #[must_use]
    pub fn decorate(self, sql: Option<&str>, type_name: &str, record: Option<String>) -> Self {
        match self {
            Error::Query(mut q) => {
                if q.sql.is_none() {
                    q.sql = sql.map(str::to_string);
                }
                if q.type_name.is_none() {
                    q.type_name = Some(type_name.to_string());
                }
                if q.record.is_none() {
                    q.record = record;
                }
                Error::Query(q)
            }
            other => other,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::MissingObject(m) => m.sql.as_deref(),
            _ => None,
        }
    }

    /// Is this a missing-or-invalid-primary-key error?
    pub fn is_missing_primary_key(&self) -> bool {
        matches!(self, Error::MissingPrimaryKey(_))
    }

    /// Is this a missing-data-access-object error?
    pub fn is_missing_object(&self) -> bool {
        matches!(self, Error::MissingObject(_))
    }

    /// The error that aborted the commit, looking through release failures.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Acquisition(a) => match (&a.cause, a.first()) {
                (Some(cause), _) => cause.root_cause(),
                (None, Some(first)) => first.root_cause(),
                (None, None) => self,
            },
            other => other,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MissingPrimaryKey(e) => write!(
                f,
                "Missing or invalid primary key: the object {} ({}) is missing a primary key",
                e.record, e.type_name
            ),
            Error::MissingObject(e) => write!(
                f,
                "Missing data access object: update of {} ({}) affected no rows",
                e.record, e.type_name
            ),
            Error::UnsupportedState(e) => match &e.record {
                Some(record) => write!(f, "Unsupported state for {}: {}", record, e.message),
                None => write!(f, "Unsupported state: {}", e.message),
            },
            Error::UnresolvedDependencies(e) => write!(
                f,
                "Insert round {} made no progress; unresolvable dependencies among: {}",
                e.round,
                e.records.join(", ")
            ),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Acquisition(e) => write!(f, "{}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Acquisition(e) => e
                .cause
                .as_deref()
                .or_else(|| e.first())
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(type_name) = &self.type_name {
            write!(f, " [type {}]", type_name)?;
        }
        if let Some(record) = &self.record {
            write!(f, " [record {}]", record)?;
        }
        if let Some(sql) = &self.sql {
            write!(f, " [sql {}]", sql)?;
        }
        Ok(())
    }
}

impl fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.first() {
            Some(first) => write!(
                f,
                "{} acquisition release(s) failed, first: {}",
                self.failures.len(),
                first
            )?,
            None => write!(f, "acquisition release failed")?,
        }
        if let Some(cause) = &self.cause {
            write!(f, "; commit error: {}", cause)?;
        }
        Ok(())
    }
}

impl From<MissingPrimaryKeyError> for Error {
    fn from(err: MissingPrimaryKeyError) -> Self {
        Error::MissingPrimaryKey(err)
    }
}

impl From<MissingObjectError> for Error {
    fn from(err: MissingObjectError) -> Self {
        Error::MissingObject(err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::UnsupportedState(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<AcquisitionError> for Error {
    fn from(err: AcquisitionError) -> Self {
        Error::Acquisition(err)
    }
}

/// Result type alias for objcache operations.
pub type Result<T> = std::result::Result<T, Error>;
