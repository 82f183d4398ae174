//! Host Controller Interface types shared with the GATT client
//! ([Vol 4] Part E).

pub use {consts::*, handle::*};

mod consts;
mod handle;
