pub mod auth;
pub mod channel;
pub mod config;
pub mod gateway;
pub mod ids;
pub mod plugin;
pub mod router;

mod error;

#[cfg(test)]
mod tests;

pub use error::{Error, GatewayError, Result};
pub use gateway::{GatewayCore, PRODUCT, Subscriber, VERSION};

pub use gotapi_types::*;
