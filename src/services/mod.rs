// src/services/mod.rs
pub mod api_server;
pub mod fleet;
pub mod identity_chain;
pub mod oracle;
