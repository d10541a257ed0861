pub mod app;
pub mod config;
pub mod db;
pub mod errors;
pub mod health;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod telemetry;
pub mod utils;

#[cfg(test)]
mod testing;
