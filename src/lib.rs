pub mod aggregator;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod diff;
pub mod gateway;
pub mod images;
pub mod logging;
pub mod parser;
pub mod payload;
pub mod processor;
pub mod server;
pub mod sse;
pub mod stats;
pub mod tracker;
pub mod types;

pub use server::AppState;
pub use types::{ObservedError, PeriscopeError, Result};
