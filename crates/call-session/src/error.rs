use thiserror::Error;

/// User-facing failures reported by the call controller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("invalid call code '{0}': expected six letters or digits")]
    InvalidCode(String),
    #[error("call code not found")]
    NotFound,
    #[error("call is full (maximum 2 participants)")]
    Full,
    #[error("the owner is already reviewing another join request")]
    Busy,
    #[error("the owner declined the join request")]
    Rejected,
    #[error("rendezvous registry unavailable: {0}")]
    RegistryUnavailable(String),
    #[error("unable to access camera/microphone: {0}")]
    Media(String),
    #[error("connection failed")]
    ConnectionFailed,
    #[error("the other participant left the call")]
    RemoteLeft,
    #[error("a call is already in progress")]
    AlreadyActive,
    #[error("only the call owner can admit participants")]
    NotOwner,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected locally, never reached the network.
    Input,
    /// Reported by the rendezvous registry.
    Registry,
    /// Peer transport could not be established.
    Negotiation,
    /// Local capture denied or unavailable.
    Media,
    /// Operation not valid in the current call state.
    State,
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::InvalidCode(_) => ErrorKind::Input,
            CallError::NotFound
            | CallError::Full
            | CallError::Busy
            | CallError::Rejected
            | CallError::RegistryUnavailable(_)
            | CallError::RemoteLeft => ErrorKind::Registry,
            CallError::ConnectionFailed => ErrorKind::Negotiation,
            CallError::Media(_) => ErrorKind::Media,
            CallError::AlreadyActive | CallError::NotOwner => ErrorKind::State,
        }
    }
}
