#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod auth;
pub mod client;
pub mod config;
pub mod credentials;
pub mod models;
pub mod refresh;
pub mod storage;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
