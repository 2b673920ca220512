use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Invalid provisioning plan: {0}")]
    InvalidPlan(String),
    #[error("Could not reach database server: {0}")]
    Connection(String),
    #[error("User {user}@{db} already exists: {message}")]
    DuplicateUser {
        user: String,
        db: String,
        message: String,
    },
    #[error("Failed to create index on {collection}.{field}: {message}")]
    IndexCreation {
        collection: String,
        field: String,
        message: String,
    },
    #[error("Database error: {0}")]
    Engine(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProvisionError {
    pub fn is_duplicate_user(&self) -> bool {
        matches!(self, ProvisionError::DuplicateUser { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, ProvisionError::Connection(_))
    }
}
