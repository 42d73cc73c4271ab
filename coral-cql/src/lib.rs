//! CQL binary protocol types and primitives.
//!
//! Mainly intended to be used by the coral driver, but can also be useful
//! for other applications that need to talk raw CQL.

pub mod deserialize;
pub mod frame;
pub mod serialize;
pub mod value;

pub use crate::frame::types::Consistency;
pub use crate::frame::types::SerialConsistency;
