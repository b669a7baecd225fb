use thiserror::Error;

/// Error taxonomy shared by `MountService` and `NodeDispatcher`. Lower level
/// modules (`driver`, `ledger`, `serializer`) have their own `thiserror`
/// enums and convert into this one at the service boundary.
#[derive(Error, Debug)]
pub enum DmsError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("backup target {0} not found")]
    TargetNotFound(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("failed to fetch credentials: {0}")]
    CredentialFetchFailed(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("unmount failed: {0}")]
    UnmountFailed(String),

    #[error("timed out acquiring serializer lock after {0:?}")]
    LockTimeout(std::time::Duration),

    #[error("operation timed out")]
    Timeout,

    #[error("transient error, retry: {0}")]
    Transient(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Driver(#[from] crate::driver::Error),

    #[error(transparent)]
    Ledger(#[from] crate::ledger::Error),

    #[error(transparent)]
    Serializer(#[from] crate::serializer::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DmsError {
    /// matches the `code` field in the wire protocol's error reply.
    pub fn code(&self) -> &'static str {
        match self {
            DmsError::BadRequest(_) => "bad_request",
            DmsError::TargetNotFound(_) => "target_not_found",
            DmsError::AuthFailed(_) => "auth_failed",
            DmsError::CredentialFetchFailed(_) => "credential_fetch_failed",
            DmsError::MountFailed(_) => "mount_failed",
            DmsError::UnmountFailed(_) => "unmount_failed",
            DmsError::LockTimeout(_) => "lock_timeout",
            DmsError::Timeout => "timeout",
            DmsError::Transient(_) => "transient",
            DmsError::Fatal(_) => "fatal",
            DmsError::Driver(_) => "mount_failed",
            DmsError::Ledger(_) => "transient",
            DmsError::Serializer(_) => "lock_timeout",
            DmsError::Other(_) => "fatal",
        }
    }
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("credential {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Fetch(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("token rejected: {0}")]
    Rejected(String),
}
