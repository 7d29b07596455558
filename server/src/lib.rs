//! # Flaggi Game Server Library
//!
//! Authoritative server core for a real-time multiplayer 2D game. Clients
//! join over a reliable stream channel, then push their own state several
//! times a second as small text datagrams. The server keeps the latest state
//! of every player and sends the whole world back to everyone on a fixed tick.
//!
//! ## Core Responsibilities
//!
//! ### Session Lifecycle
//! - Registration over the reliable channel with a display name
//! - Liveness probes (`ping`) that never create a session
//! - Removal on explicit disconnect, on channel close, or after going quiet
//!
//! ### State Synchronisation
//! Inbound records are last-write-wins per session. Every tick the update
//! loop applies what arrived since the previous tick and broadcasts one
//! snapshot datagram per live session.
//!
//! ### Abuse Resistance
//! A per-address rate limiter guards the datagram path, queues are bounded
//! and drop rather than block, and the gateway caps concurrent connections.
//!
//! ## Architecture Design
//!
//! Three independent task groups share nothing but the session registry and
//! a bounded queue:
//!
//! ```text
//!   TCP ──► gateway ──► registry ◄── update loop ──► broadcast ──► UDP
//!                                        ▲
//!   UDP ──► ingest ──► rate limiter ──► queue
//! ```
//!
//! Only the update loop mutates per-session game state, so there is a single
//! writer for everything clients see.
//!
//! ## Module Organization
//!
//! - `config`: startup parameters and their TOML form
//! - `error`: error types for the connection and server layers
//! - `framing`: length-prefixed messages on the reliable channel
//! - `registry`: authoritative session map
//! - `rate_limiter`: per-address admission control
//! - `gateway`: reliable-channel accept loop and handshake
//! - `ingest`: datagram receive loop
//! - `update_loop`: the fixed-interval tick
//! - `broadcast`: snapshot fan-out
//! - `network`: binds both sockets and runs everything
//! - `probe`: minimal client for testing
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     let handle = server.start()?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod error;
pub mod framing;
pub mod gateway;
pub mod ingest;
pub mod network;
pub mod probe;
pub mod rate_limiter;
pub mod registry;
pub mod update_loop;
