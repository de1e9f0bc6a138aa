//! Error types for patch application

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatchError {
    #[error("Invalid pointer: {0}")]
    InvalidPointer(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Index out of bounds at {path}: {index}")]
    IndexOutOfBounds { path: String, index: usize },

    #[error("Not a container: {0}")]
    NotAContainer(String),
}
