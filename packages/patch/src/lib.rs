//! # Quire Patch
//!
//! Structural diff and patch primitives for JSON documents.
//!
//! The engine never inspects patches beyond storing, merging and replaying
//! them; this crate is the single place that knows how a document changes.
//!
//! ```rust,ignore
//! use quire_patch::{apply, diff};
//! use serde_json::json;
//!
//! let before = json!({ "name": "a", "tags": ["x"] });
//! let after = json!({ "name": "b", "tags": ["x", "y"] });
//!
//! let forward = diff(&before, &after);
//! let reverse = diff(&after, &before);
//!
//! let mut doc = before.clone();
//! apply(&mut doc, &forward)?;
//! assert_eq!(doc, after);
//! apply(&mut doc, &reverse)?;
//! assert_eq!(doc, before);
//! ```

mod diff;
mod errors;
mod operation;
pub mod pointer;

pub use diff::diff;
pub use errors::PatchError;
pub use operation::{apply, Operation, Patch};
