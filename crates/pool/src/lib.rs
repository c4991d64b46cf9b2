pub mod error;
pub mod handler;
pub mod interrupt;
pub mod reclaim;
pub mod request;
pub mod worker_pool;

pub use error::*;
pub use handler::*;
pub use interrupt::*;
pub use reclaim::*;
pub use request::*;
pub use worker_pool::*;
