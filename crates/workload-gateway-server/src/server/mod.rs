pub mod address;
pub mod attestor;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod manager;
pub mod middleware;
pub mod peer;
pub mod pem;
pub mod registry;
pub mod service;
pub mod telemetry;
