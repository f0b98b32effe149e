//! GotAPI gateway server.
//!
//! This crate puts the gateway core behind its two app-facing front ends,
//! HTTP (`/gotapi/<profile>[/<attribute>]`) and WebSocket
//! (`/gotapi/websocket`), and provides the built-in example plugins.

pub mod access;
pub mod error;
pub(crate) mod http;
pub mod plugins;
pub mod server;
pub(crate) mod ws;

pub use access::AccessPolicy;
pub use error::{DaemonError, Result};
pub use server::{AppState, router, run, serve};
