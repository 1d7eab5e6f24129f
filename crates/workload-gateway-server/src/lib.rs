#![doc = include_str!("../README.md")]

pub mod server;

pub use server::address::BindAddr;
pub use server::endpoint::{Config, Endpoint};
pub use server::error::{Error, Result};
