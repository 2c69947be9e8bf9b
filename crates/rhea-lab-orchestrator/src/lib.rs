pub mod backend;
pub mod checkpoints;
pub mod config;
pub mod environment;
pub mod error;
pub mod executor;
pub mod resolver;
pub mod runner;
pub mod session;

pub use error::{Error, Result};
