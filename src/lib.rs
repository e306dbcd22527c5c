#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod error;
pub mod feed;
pub mod model;
pub mod owldb;
pub mod render;
pub mod store;
pub mod thread;
pub mod validation;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{run, run_demo, RunOptions};
