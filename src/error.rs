use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("diff error: {0}")]
    Diff(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("verification error: {0}")]
    Verification(String),
}

pub type Result<T> = std::result::Result<T, Error>;
