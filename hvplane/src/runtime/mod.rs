pub mod constants;
pub mod core;
pub mod layout;
pub mod options;

pub use self::core::ControlPlane;
pub use options::{HostEndpoint, HvOptions, Timeouts};
