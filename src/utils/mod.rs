// src/utils/mod.rs
pub mod crypto;
pub mod retry;
pub mod serialization;
