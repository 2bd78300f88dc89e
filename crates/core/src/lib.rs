//! Core of the roomcast audio room client
//!
//! Everything here is platform independent: device access, media decoding
//! and the signaling wire live behind traits implemented in `roomcast-infra`.

pub mod domain;
