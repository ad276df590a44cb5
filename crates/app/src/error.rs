//! Application error type

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] huddle_core::Error),

    #[error("Network error: {0}")]
    Net(#[from] huddle_net::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type AppResult<T> = std::result::Result<T, AppError>;
