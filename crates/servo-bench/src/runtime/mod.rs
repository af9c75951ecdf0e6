mod app;
mod config;
mod logging;
mod plot;
mod telemetry;

pub use app::run_from_args;
