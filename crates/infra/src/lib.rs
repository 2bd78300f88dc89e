//! Platform adapters for roomcast: cpal audio devices, symphonia media
//! decoding and the Janus HTTP signaling transport

pub mod audio;
pub mod media;
pub mod signaling;
