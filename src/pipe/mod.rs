pub mod admin;
pub mod app;
pub mod config;
pub mod logging;
pub mod telemetry;
pub mod tunnel;

pub use app::{run_client, run_server};
