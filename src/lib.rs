pub mod app_state;
pub mod auth;
pub mod billing;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod registry;
pub mod storage;
pub mod telemetry;
pub mod upstream;
