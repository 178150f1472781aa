pub mod retry;
pub mod table;

pub use retry::RetryWaiter;
