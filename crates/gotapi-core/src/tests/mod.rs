//! Test module for gotapi-core
//!
//! Covers the pieces that need more than one module to exercise:
//! - Session authority handshake and pending-authorization lifetime
//! - Router correlation, handshake caching, discovery order and the watchdog
//! - Plugin registry loading against real host tasks
//! - Gateway core end to end, including event delivery
//! - Configuration loading from disk

mod auth_tests;
