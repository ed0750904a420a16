//! Error types, one enum per failure domain.
//!
//! Each module that can fail defines its own error enum (see `codec`,
//! `framed`, `node`) rather than funneling everything through a single
//! umbrella type. This module only re-exports them for callers who want one
//! import path, plus [`NodeError`], which is the only error `Node::run`
//! itself can return.

pub use crate::codec::CodecError;
pub use crate::framed::ConnectionError;

use thiserror::Error;

/// Errors that can cause [`crate::node::Node::run`] to return early.
///
/// Everything else — dial failures, decode errors on a single peer,
/// handler panics — is handled internally and observed only indirectly,
/// through a handler not firing, an on-disconnect hook firing, or
/// [`crate::node::Node::num_connected_peers`] decreasing.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}
