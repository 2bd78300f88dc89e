//! Signaling transports for real conference backends

pub mod janus_http;

pub use janus_http::JanusHttpTransport;
