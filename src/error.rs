use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid magic: expected {expected}, got {found}")]
    InvalidMagic { expected: String, found: String },
    #[error("Missing key: {0}")]
    MissingKey(String),
    #[error("Key not derived: {0}")]
    KeyNotDerived(String),
    #[error("Crypto input length {len} is not a multiple of {align} bytes")]
    CryptoSize { len: usize, align: usize },
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Parse error: {0}")]
    Parse(#[from] binrw::Error),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
