pub mod api;
pub mod cache;
pub mod config;
pub mod domain;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod store;
pub mod utils;
