use crate::version::{Phase, Version};

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("concurrent migration `{0}`")]
    ConcurrentMigration(String),

    #[error("invalid migration definition `{0}`")]
    InvalidMigrationDefinition(String),

    #[error("migration to version {0} already done")]
    MigrationAlreadyDone(Version),

    #[error("migration to version {0} not started")]
    MigrationNotStarted(Version),

    #[error("version {version} is not {expected}")]
    UnexpectedPhase { version: Version, expected: Phase },

    #[error("can not have more groups {groups} than number of prefixes {prefixes}")]
    TooManyGroups { groups: usize, prefixes: usize },

    #[error("replaying failed for ids ^{first} - {last}")]
    ReplayFailed {
        first: String,
        last: String,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("replay cancelled")]
    ReplayCancelled,

    #[error("table `{0}` not found")]
    TableNotFound(String),

    #[error("table `{0}` already exists")]
    TableAlreadyExists(String),

    #[error("row of `{table}` has no `{key}` key")]
    MissingKey { table: String, key: String },

    #[error("store `{0}`")]
    Store(#[from] reproject_store::StoreError),

    #[cfg(feature = "pg")]
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("join `{0}`")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl MigrationError {
    /// Whether a migration failing with this error must be rolled back.
    ///
    /// Concurrency and definition errors are raised before anything is
    /// mutated, so there is nothing to undo.
    pub fn should_rollback(&self) -> bool {
        !matches!(
            self,
            MigrationError::ConcurrentMigration(_)
                | MigrationError::InvalidMigrationDefinition(_)
                | MigrationError::MigrationAlreadyDone(_)
                | MigrationError::MigrationNotStarted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;
