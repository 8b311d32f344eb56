use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum Error {
    /// Token rejected (401/403). Fatal for the controller until reconfigured.
    Auth(u16),
    NotFound(String),
    RateLimited { retry_after: Option<Duration> },
    Timeout,
    Transport(reqwest::Error),
    /// Unexpected HTTP status; handled like a transport failure.
    Status(u16),
    MalformedResponse(String),
    UnknownTarget(String),
    NotRunnable(String),
    InvalidParameter(String),
    Config(String),
    Io(std::io::Error),
}

impl Error {
    /// Recoverable on the next natural cycle, never retried in a tight loop.
    pub fn is_transport_class(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::Transport(_) | Error::Status(_) | Error::MalformedResponse(_)
        )
    }

    /// Surfaced to the caller immediately, no retry.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::UnknownTarget(_)
                | Error::NotRunnable(_)
                | Error::InvalidParameter(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Auth(status) => write!(f, "authentication rejected (HTTP {status})"),
            Error::NotFound(what) => write!(f, "not found: {what}"),
            Error::RateLimited {
                retry_after: Some(d),
            } => write!(f, "rate limited, retry after {}s", d.as_secs()),
            Error::RateLimited { retry_after: None } => write!(f, "rate limited"),
            Error::Timeout => write!(f, "request timed out"),
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::Status(status) => write!(f, "unexpected HTTP status {status}"),
            Error::MalformedResponse(msg) => write!(f, "malformed response: {msg}"),
            Error::UnknownTarget(target) => write!(f, "unknown target: {target}"),
            Error::NotRunnable(schedule) => write!(f, "not runnable on demand: {schedule}"),
            Error::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else if e.is_decode() {
            Error::MalformedResponse(e.to_string())
        } else {
            Error::Transport(e)
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
