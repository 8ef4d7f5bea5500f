pub mod api;
pub mod config;
pub mod engine;
pub mod mesh;
pub mod metrics;
pub mod protection;
#[cfg(feature = "sim")]
pub mod sim;
pub mod telemetry;
pub mod topology;
