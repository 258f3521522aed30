pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod provider;
pub mod request;
pub mod security;
pub mod store;
pub mod utils;

pub use error::{AppError, Result};
