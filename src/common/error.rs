//! Error types for blockorc

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    // === Lookup / validation Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Volume lifecycle Errors ===
    #[error("Volume '{0}' is not attached")]
    NotAttached(String),

    #[error("No replicas to start the controller for volume '{0}'")]
    NoReplicas(String),

    #[error("Volume '{0}' has no more good replicas")]
    NoGoodReplicas(String),

    // === Controller Errors ===
    #[error("Controller failed, volume '{volume}': {source}")]
    ControllerFailed {
        volume: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Replica chain mismatch: '{expected}' vs '{actual}'")]
    ChainMismatch { expected: String, actual: String },

    #[error("Cannot parse replica status: {0}")]
    ParseStatus(String),

    // === Placement Errors ===
    #[error("Wrong host routing: should be at '{expected}', this is '{current}'")]
    WrongHost { expected: String, current: String },

    #[error("Unable to find suitable host for scheduling")]
    NoSuitableHost,

    #[error("Invalid instance: {0}")]
    InvalidInstance(String),

    // === Task queue Errors ===
    #[error("Task queue is closed")]
    QueueClosed,

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Composite Errors ===
    #[error("{0}")]
    Aggregate(Errors),

    #[error("{message}: {source}")]
    Context {
        message: String,
        #[source]
        source: Box<Error>,
    },

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Fatal errors end a monitoring session: the control process is gone
    /// or the volume lost every good replica.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::ControllerFailed { .. } | Error::NoGoodReplicas(_) => true,
            Error::Context { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    pub fn controller_failed(volume: impl Into<String>, source: Error) -> Self {
        Error::ControllerFailed {
            volume: volume.into(),
            source: Box::new(source),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidArgument(_) | Error::InvalidConfig(_) | Error::WrongHost { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::NotAttached(_) => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::NoSuitableHost => StatusCode::SERVICE_UNAVAILABLE,
            Error::Context { source, .. } => source.to_http_status(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Every failure of a fan-out operation, in completion order.
#[derive(Debug, Default)]
pub struct Errors(pub Vec<Error>);

impl Errors {
    /// Collapse per-item results into one result. All failures are logged
    /// and kept; none short-circuits the others.
    pub fn collect<I>(results: I) -> Result<()>
    where
        I: IntoIterator<Item = Result<()>>,
    {
        let errs: Vec<Error> = results
            .into_iter()
            .filter_map(|r| r.err())
            .inspect(|e| tracing::error!("{}", e))
            .collect();
        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(Errors(errs)))
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.0.iter()
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}

/// Attach operation and identity context to an error as it crosses a layer.
pub trait ResultExt<T> {
    fn context(self, message: impl Into<String>) -> Result<T>;

    fn with_context<M, F>(self, f: F) -> Result<T>
    where
        M: Into<String>,
        F: FnOnce() -> M;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            message: message.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<M, F>(self, f: F) -> Result<T>
    where
        M: Into<String>,
        F: FnOnce() -> M,
    {
        self.map_err(|e| Error::Context {
            message: f().into(),
            source: Box::new(e.into()),
        })
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_through_context() {
        let err: Result<()> = Err(Error::controller_failed("v1", Error::from("gone")));
        let wrapped = err.context("checking volume 'v1'").unwrap_err();
        assert!(wrapped.is_fatal());
        assert!(wrapped.to_string().starts_with("checking volume 'v1': "));

        let plain: Result<()> = Err(Error::Http("500".into()));
        assert!(!plain.context("x").unwrap_err().is_fatal());
    }

    #[test]
    fn test_collect_keeps_every_error() {
        let results = vec![
            Ok(()),
            Err(Error::from("first")),
            Ok(()),
            Err(Error::from("second")),
        ];
        match Errors::collect(results) {
            Err(Error::Aggregate(errs)) => {
                assert_eq!(errs.len(), 2);
                assert_eq!(errs.to_string(), "first; second");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Errors::collect(vec![Ok(()), Ok(())]).is_ok());
    }

    #[test]
    fn test_http_status() {
        use axum::http::StatusCode;
        assert_eq!(
            Error::NotFound("v".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        let wrong = Error::WrongHost {
            expected: "a".into(),
            current: "b".into(),
        };
        assert_eq!(wrong.to_http_status(), StatusCode::BAD_REQUEST);
    }
}
