#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate sequence number `{0}`")]
    DuplicateSequenceNumber(String),

    #[error("cursor `{0}`")]
    Cursor(String),

    #[cfg(feature = "pg")]
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("base64 `{0}`")]
    Base64(#[from] base64::DecodeError),

    #[error("str utf8 `{0}`")]
    StrUtf8(#[from] std::str::Utf8Error),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
