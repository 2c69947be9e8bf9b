use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// A backend primitive was used before an environment was bound to it.
    EnvironmentNotInitialized,
    /// The lab reported a state label other than the one the configuration declares.
    EnvironmentWrongState { expected: String, actual: String },
    /// The lab's provisioning status is an explicit failure.
    EnvironmentBadState(String),
    /// Nodes did not become reachable within the start() timeout.
    NodeUnreachable { roles: String, waited_secs: u64 },
    /// An operation exhausted its retries with skip_on_fail=false.
    StepFailed {
        batch: String,
        ordinal: usize,
        description: String,
    },
    /// An upload/download glob matched nothing with skip_on_fail=false.
    NothingToTransfer { pattern: String },
    Msg(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EnvironmentNotInitialized => {
                write!(f, "environment not initialized")
            }
            Error::EnvironmentWrongState { expected, actual } => write!(
                f,
                "environment in wrong state: expected '{expected}', lab reports '{actual}'"
            ),
            Error::EnvironmentBadState(status) => {
                write!(f, "environment in bad state: provisioning status '{status}'")
            }
            Error::NodeUnreachable { roles, waited_secs } => write!(
                f,
                "nodes matching '{roles}' not reachable after {waited_secs}s"
            ),
            Error::StepFailed {
                batch,
                ordinal,
                description,
            } => write!(f, "step {ordinal} of batch '{batch}' failed: {description}"),
            Error::NothingToTransfer { pattern } => {
                write!(f, "nothing to transfer: '{pattern}' matched no files")
            }
            Error::Msg(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
