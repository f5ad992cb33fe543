//! API-key authentication

pub mod api_key;

pub use api_key::{display_prefix, generate_key, hash_secret, looks_like_key};
