//! Secret handling utilities.
//!
//! Re-exports secrecy types used for the database URL and the broker
//! password so they never reach a log line.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
