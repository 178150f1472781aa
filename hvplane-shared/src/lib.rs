//! Types shared between the hvplane control plane and the harnesses that drive it.

pub mod errors;

pub use errors::{HvError, HvResult};
