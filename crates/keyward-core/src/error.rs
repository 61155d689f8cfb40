use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeywardError {
    // IO
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Config
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Configuration file not found at {0}")]
    ConfigNotFound(String),

    // Key lifecycle
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Managed key not found: {0}")]
    ManagedKeyNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Ciphertext version {requested} is below the minimum decryption version {minimum}")]
    VersionBelowMinimum { requested: u32, minimum: u32 },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    // Crypto
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // Serialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(String),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),
}

pub type Result<T> = std::result::Result<T, KeywardError>;
