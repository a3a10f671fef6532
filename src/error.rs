//! Error types for Dripline.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Enrollment error: {0}")]
    Enrollment(#[from] EnrollmentError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
///
/// Store failures are fatal for the current operation but never for the
/// process: a failed fire-loop tick is retried on the next cadence.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Message catalog errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Unknown message key: {key}")]
    UnknownKey { key: String },

    #[error("Catalog file is not a JSON object of strings: {0}")]
    BadFormat(String),

    #[error("Catalog is missing required key: {key}")]
    MissingRequired { key: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Enrollment-time errors. Surfaced to the inbound handler, which still
/// sends the synchronous reply and merely skips the enrollment.
#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("Unknown campaign: {campaign_id}")]
    UnknownCampaign { campaign_id: String },

    #[error("Cannot enroll an empty user id")]
    EmptyUserId,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Messaging-transport errors. Transient: a failed push leaves the job
/// pending for retry; a failed reply is logged and the webhook handshake
/// still completes.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Provider rejected the message ({status}): {body}")]
    Api { status: u16, body: String },
}

/// Inbound webhook errors. All map to a 400 response.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Missing X-Line-Signature header")]
    MissingSignature,

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Unparseable webhook payload: {0}")]
    BadPayload(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
