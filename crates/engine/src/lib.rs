pub mod admission;
pub mod cache;
pub mod config;
pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod park;
pub mod scheduler;

pub use admission::{ANONYMOUS, Admission, AdmissionGate, identity_of};
pub use cache::{CacheConfig, CacheHit, ResponseCache, VARY_COOKIES_HEADER};
pub use config::{ConfigError, ServerConfig};
pub use cron::CronPattern;
pub use dispatch::{ABANDONED_STATUS, BLOCK_HEADER, Completion, Delivery, Source, synthesized};
pub use engine::Engine;
pub use park::{ParkResolution, Parked, ParkingTable};
pub use scheduler::{PeriodicScheduler, Schedule};
