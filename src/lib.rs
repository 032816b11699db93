#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod auth;
pub mod config;
pub mod data;
pub mod mastodon;
pub mod render;
pub mod route;
pub mod session;
pub mod storage;
pub mod thread;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
