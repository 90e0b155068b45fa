#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod background;
pub mod config;
pub mod decorate;
pub mod dismissals;
pub mod dom;
pub mod identity;
pub mod messages;
pub mod scanner;
pub mod scheduler;
pub mod selector;
pub mod session;
pub mod storage;
pub mod watcher;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
