use thiserror::Error;

/// Failure kinds shared by every component.
///
/// Dispatch boundaries decide what a kind means for the process: a
/// `MalformedMessage` tears down one TCP peer but only drops a datagram,
/// while a `TransportFailure` ends the client and the tracker.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("no response after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("resource failure: {0}")]
    ResourceFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedMessage(reason.into())
    }

    pub fn violation(reason: impl Into<String>) -> Self {
        Error::ProtocolViolation(reason.into())
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Error::TransportFailure(reason.into())
    }

    pub fn resource(reason: impl Into<String>) -> Self {
        Error::ResourceFailure(reason.into())
    }

    /// True for failures that should end a process whose only link is gone.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::TransportFailure(_) | Error::RetriesExhausted { .. } | Error::Io(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::MalformedMessage(err.to_string())
    }
}
