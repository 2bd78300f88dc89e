//! Cross-crate integration tests for roomcast

#[cfg(test)]
mod routing_integration;
#[cfg(test)]
mod session_integration;
#[cfg(test)]
mod support;
