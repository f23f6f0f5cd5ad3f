use uuid::Uuid;

/// Raised by [`EventLog::subscribe`](crate::EventLog::subscribe) when the
/// requested starting id has been truncated away or never existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventIdNotFound {
    pub id: Uuid,
}

impl std::fmt::Display for EventIdNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event id not found in the log: {}", self.id)
    }
}

impl std::error::Error for EventIdNotFound {}

/// Error type for backend failures
#[derive(Debug)]
pub enum BackendError {
    EventIdNotFound(EventIdNotFound),
    IoError(std::io::Error),
    SnapshotCorrupted(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::EventIdNotFound(e) => write!(f, "{}", e),
            BackendError::IoError(e) => write!(f, "IO error: {}", e),
            BackendError::SnapshotCorrupted(msg) => {
                write!(f, "Snapshot corrupted: {}", msg)
            }
        }
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::IoError(err)
    }
}

impl From<EventIdNotFound> for BackendError {
    fn from(err: EventIdNotFound) -> Self {
        BackendError::EventIdNotFound(err)
    }
}
