//! clawrelay core library: pairing store, OpenClaw gateway client and the HTTP relay
//! that lets a browser chat with a paired gateway.

pub mod config;
pub mod crypto;
pub mod gateway;
pub mod pairing;
pub mod relay;
