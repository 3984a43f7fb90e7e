pub mod analytics;
pub mod api_client;
pub mod cache;
pub mod config;
pub mod frequency;
pub mod manager;
pub mod queue;
pub mod sdk;
pub mod suppress;
pub mod targeting;
