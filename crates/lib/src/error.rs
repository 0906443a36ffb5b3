//! The error taxonomy for upgrade operations.
//!
//! Operations return [`anyhow::Result`]; when a failure belongs to one of
//! the classes below it is raised as an [`Error`] so that callers can
//! classify it with `downcast_ref`.

/// A classified failure of an upgrade operation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration is missing or malformed.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// The repository backend failed.
    #[error("Repository operation failed: {0}")]
    Repo(String),
    /// Not enough free space on the target partition.
    #[error("Insufficient free space on {path} (available: {available} bytes, required: {required} bytes)")]
    Space {
        /// The path whose partition was measured.
        path: String,
        /// Free bytes.
        available: u64,
        /// Bytes needed.
        required: u64,
    },
    /// Applying or removing mounts failed.
    #[error("Mount failed: {0}")]
    Mount(String),
    /// The version may not be deleted.
    #[error("Version {0} is protected and cannot be deleted")]
    ProtectedVersion(String),
    /// Another instance holds the lock.
    #[error("Another upgrade operation is already running (pid {0})")]
    AlreadyRunning(u32),
    /// The version string is not a valid branch name.
    #[error("Invalid branch name: {0}")]
    InvalidBranch(String),
}

/// Find the classified error, if any, in an error chain.
pub fn classify(e: &anyhow::Error) -> Option<&Error> {
    e.chain().find_map(|c| c.downcast_ref::<Error>())
}
