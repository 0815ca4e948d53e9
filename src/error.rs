use serde_derive::{Deserialize, Serialize};

/// A replichat error. Errors are serializable, since they cross both the
/// client and peer wire protocols, and application errors are cached in the
/// state machine's command dedup table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted and must be retried, typically because
    /// leadership was lost while a request was in flight.
    Abort,
    /// The account name is already taken.
    AlreadyExists(String),
    /// Unknown username or wrong password.
    BadCredentials,
    /// The requested log index has been compacted into a snapshot.
    Compacted,
    /// Invalid data, e.g. a corrupt store or malformed message. This is
    /// fatal at the node that encounters it.
    InvalidData(String),
    /// An invalid user request.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// No leader is currently known; the client should retry later.
    NoLeader,
    /// A leader-only request was sent to a non-leader replica. Carries an
    /// advisory address for the current leader, if known.
    NotLeader(Option<String>),
    /// The request timed out. The command may still commit and apply later;
    /// retries are deduplicated by the state machine.
    Timeout,
    /// The message recipient does not exist.
    UnknownRecipient(String),
    /// The user does not exist.
    UnknownUser(String),
}

/// A replichat result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns whether the error is transient and the request can be
    /// retried, possibly against a different replica.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Abort | Error::NoLeader | Error::NotLeader(_) | Error::Timeout)
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::AlreadyExists(name) => write!(f, "user {name} already exists"),
            Error::BadCredentials => write!(f, "invalid username or password"),
            Error::Compacted => write!(f, "log index compacted into snapshot"),
            Error::InvalidData(message) => write!(f, "invalid data: {message}"),
            Error::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Error::IO(message) => write!(f, "io error: {message}"),
            Error::NoLeader => write!(f, "no leader known, try again later"),
            Error::NotLeader(Some(addr)) => write!(f, "not the leader, try {addr}"),
            Error::NotLeader(None) => write!(f, "not the leader"),
            Error::Timeout => write!(f, "request timed out"),
            Error::UnknownRecipient(name) => write!(f, "recipient {name} does not exist"),
            Error::UnknownUser(name) => write!(f, "user {name} does not exist"),
        }
    }
}

/// Constructs an Error::InvalidData via format!(), and wraps it in
/// Result::Err.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidData(format!($($args)*))) };
}

/// Constructs an Error::InvalidInput via format!(), and wraps it in
/// Result::Err.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidInput(format!($($args)*))) };
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::IO("channel disconnected".to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(_: crossbeam::channel::RecvError) -> Self {
        Error::IO("channel disconnected".to_string())
    }
}

impl From<crossbeam::channel::RecvTimeoutError> for Error {
    fn from(err: crossbeam::channel::RecvTimeoutError) -> Self {
        match err {
            crossbeam::channel::RecvTimeoutError::Timeout => Error::Timeout,
            crossbeam::channel::RecvTimeoutError::Disconnected => {
                Error::IO("channel disconnected".to_string())
            }
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
