//! Generic Access Profile ([Vol 3] Part C) assigned numbers.

pub use gattsc_const::{Characteristic, Descriptor, Service, Uuid, UuidPacker};
