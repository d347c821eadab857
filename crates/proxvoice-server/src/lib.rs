//! Positional voice coordination server.
//!
//! Tracks player positions for an embedding game host, computes which
//! players can hear which other players, and streams audibility deltas
//! and positions to the connected voice clients. Audio itself never
//! touches this server; the clients mix it locally against a TeamSpeak
//! backend.

pub mod callbacks;
pub mod config;
pub mod server;
pub mod state;
pub mod transport;

mod engine;
mod session;

pub use config::ServerConfig;
pub use server::{ClientPositionUpdate, VoiceServer, MAX_CLIENTS};
