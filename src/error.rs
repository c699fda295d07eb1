use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Connection error ({target}): {message}")]
    Connection { target: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Insert conflict on {table}: {detail}")]
    InsertConflict { table: String, detail: String },

    #[error("Insert into {table} failed: {message}")]
    InsertFailed { table: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source {country} skipped {skipped} of {read} aggregated rows (limit {limit:.2})")]
    SkipThresholdExceeded {
        country: String,
        skipped: u64,
        read: u64,
        limit: f64,
    },

    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<EtlError>,
    },

    #[error("Task error: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EtlError {
    pub fn connection(target: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EtlError::Connection {
            target: target.into(),
            message: err.to_string(),
        }
    }

    /// Wrap an error with the orchestrator stage it surfaced in.
    pub fn in_stage(self, stage: impl std::fmt::Display) -> Self {
        EtlError::Stage {
            stage: stage.to_string(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
