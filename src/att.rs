//! Attribute Protocol types used by the client ([Vol 3] Part F).

pub use {consts::*, handle::*};

mod consts;
mod handle;

/// Result of an ATT procedure. The error is the code reported by the server
/// or by the local bearer.
pub type Result<T> = std::result::Result<T, ErrorCode>;
