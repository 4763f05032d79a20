/// Core error type shared by the queue, router, runner and scheduler.
///
/// Adapter crates map their own errors into this type so the core can match
/// on failure kind (e.g. to decide whether a router cursor rolls back).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid group folder {folder:?}: {reason}")]
    InvalidGroupFolder { folder: String, reason: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("agent process error: {0}")]
    Agent(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("singleton lock held by pid {pid}")]
    SingletonLockHeld { pid: i32 },
}

pub type Result<T> = std::result::Result<T, Error>;
