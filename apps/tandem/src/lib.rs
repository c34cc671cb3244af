pub mod chat;
pub mod config;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod telemetry;
pub mod transport;
