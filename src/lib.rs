pub mod cli;
pub mod config;
pub mod envelope;
pub mod error;
pub mod output;
pub mod sandbox;
pub mod server;
pub mod validate;

pub use error::{CodeletError, Result};
