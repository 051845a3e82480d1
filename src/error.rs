#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Invalid or missing configuration: mapping table problems, missing
    /// required paths, a path that is a directory.
    #[error("configuration error: {0}")]
    Config(String),
    /// A required source (beets library, Rekordbox XML) is missing or
    /// unreadable. Reported before any load begins.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// A source loaded but its contents are unusable: malformed XML, a
    /// declared attribute absent from a track, a row that cannot decode.
    #[error("load error: {0}")]
    Load(String),
    /// Schema-mapping conflicts: export rename collisions, join column
    /// collisions, unknown transform references.
    #[error("mapping error: {0}")]
    Mapping(String),
    /// One catalog record failed to persist during sync. The batch policy
    /// (skip vs abort) is the caller's decision.
    #[error("failed to update track {track_id}: {message}")]
    Update { track_id: i64, message: String },
}

impl From<serde_yaml::Error> for SyncError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(format!("field mapping parse failed: {value}"))
    }
}
