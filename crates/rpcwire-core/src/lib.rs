//! Core helpers shared by every rpcwire crate: binary primitives and
//! tracing setup.

pub mod binary;
pub mod tracing;

pub use binary::{BinaryError, BinaryReader, BinaryWriter, Endian, width_for};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
