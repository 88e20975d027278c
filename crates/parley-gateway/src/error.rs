use thiserror::Error;

/// A well-formed command that the current server state refuses.
///
/// The `Display` text is what the client sees in the `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("invalid name '{0}'")]
    InvalidName(String),

    #[error("'{0}' is already online")]
    NameTaken(String),

    #[error("this connection is already logged in as '{0}'")]
    AlreadyLoggedIn(String),

    #[error("not logged in")]
    NotLoggedIn,

    #[error("cannot act as '{claimed}' while logged in as '{bound}'")]
    IdentityMismatch { claimed: String, bound: String },

    #[error("{0} is not online")]
    UserOffline(String),

    #[error("group '{0}' already exists")]
    GroupExists(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("{user} is already a member of {group}")]
    AlreadyMember { group: String, user: String },

    #[error("{user} is not a member of {group}")]
    NotMember { group: String, user: String },

    #[error("you already have an active call")]
    CallerBusy,

    #[error("{0} is busy")]
    UserBusy(String),

    #[error("cannot call yourself")]
    SelfCall,

    #[error("nobody in {0} can take the call")]
    NobodyReachable(String),

    #[error("no ringing call to accept")]
    CallNotFound,

    #[error("call already answered")]
    CallAnswered,

    #[error("audio not found")]
    AudioNotFound,

    #[error("history unavailable")]
    HistoryUnavailable,
}
