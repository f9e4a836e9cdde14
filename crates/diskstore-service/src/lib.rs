pub mod config;
pub mod logging;
pub mod scheduler;
pub mod store;
