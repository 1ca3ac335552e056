use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Config file present but untrusted (signature or deserialization
    /// failure) and the shadow held nothing recoverable.
    #[error("config corrupted and no backup found")]
    Corrupt,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("self-protection unavailable: {0}")]
    Privilege(String),

    #[error("all NTP servers failed")]
    NetTime,

    #[error("emergency unlock limit reached ({used}/{limit})")]
    LimitReached { used: u32, limit: u32 },

    #[error("cannot disable or delete an enabled schedule during an active focus session")]
    ScheduleConflict,

    #[error("{0}")]
    Platform(String),
}

impl Error {
    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn privilege(msg: impl Into<String>) -> Self {
        Error::Privilege(msg.into())
    }
}
