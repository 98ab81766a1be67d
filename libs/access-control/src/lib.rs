pub mod accessible;
pub mod act;
pub mod cache;
pub mod config;
pub mod engine;
pub mod entity;
pub mod explain;
pub mod instrument;
pub mod memory;
pub mod metrics;
pub mod pg_store;
pub mod planner;
pub mod resolver;
pub mod store;
pub mod strategy;
