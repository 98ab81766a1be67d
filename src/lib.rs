pub mod application;
pub mod biz;
pub mod config;
pub mod state;
pub mod telemetry;
