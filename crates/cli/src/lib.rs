pub mod app;
pub mod args;

pub use args::Args;
