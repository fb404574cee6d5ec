//! Error types for the IPTV gateway.

pub mod types;

pub use types::{AppError, StreamError};

pub type AppResult<T> = Result<T, AppError>;
