// src/models/mod.rs
mod message_types;

pub use message_types::*;
