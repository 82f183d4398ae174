//! GATT profile clients built on the service client engine.

pub mod bas;
pub mod lls;
