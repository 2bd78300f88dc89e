//! Local media files through Symphonia

pub mod library;

pub use library::SymphoniaLibrary;
