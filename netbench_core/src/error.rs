//! Error types for the test-execution engine.

use std::fmt;
use std::io;

use crate::wire::Version;

/// Error type covering every way a test can fail.
#[derive(Debug)]
pub enum Error {
    /// I/O failure, tagged with the step or message that failed.
    Io { what: String, source: io::Error },
    /// The peer speaks an incompatible protocol version.
    Version { local: Version, remote: Version },
    /// The request named a test this build does not know.
    BadTest(u16),
    /// A control message ended before its fixed layout was consumed.
    Truncated(&'static str),
    /// A user-supplied parameter was not consumed by the selected test.
    UnusedParam { name: String, test: String },
    /// Invalid configuration value.
    Config(String),
    /// An atomic verification test read back an unexpected old value.
    Verify { expected: u64, got: u64 },
}

impl Error {
    /// Attach a step label to a system error, qperf's `syserror` style.
    pub fn io(what: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            what: what.into(),
            source,
        }
    }

    /// Step label plus the current `errno`.
    pub fn sys(what: impl Into<String>) -> Self {
        Error::io(what, io::Error::last_os_error())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io { what, source } => write!(f, "{what}: {source}"),
            Error::Version { local, remote } => write!(
                f,
                "protocol version mismatch: local {local}, remote {remote}"
            ),
            Error::BadTest(index) => write!(f, "bad request index: {index}"),
            Error::Truncated(what) => write!(f, "{what}: message truncated"),
            Error::UnusedParam { name, test } => {
                write!(f, "{name}: parameter not applicable to test {test}")
            }
            Error::Config(msg) => write!(f, "{msg}"),
            Error::Verify { expected, got } => write!(
                f,
                "verification mismatch: expected {expected:#x}, got {got:#x}"
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::io("I/O error", e)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
