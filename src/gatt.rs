//! Generic Attribute Profile ([Vol 3] Part G).

pub use consts::*;

pub mod client;
mod consts;
