//! # Word Session Server Library
//!
//! This library provides the authoritative server for a turn-based word game.
//! Players gather in named sessions and take turns as leader: two letters are
//! revealed, the leader builds a word that starts with the first and ends with
//! the second before the countdown runs out, and the word is scored against a
//! dictionary.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Sessions
//! Every session's state lives on exactly one task. Clients only ever see
//! snapshots of it and can only change it by sending messages that the
//! session validates (leader checks, round state, option ranges).
//!
//! ### Connection Management
//! Handles the complete lifecycle of client connections including:
//! - Token assignment and the token → connection directory
//! - Binding a connection to the session it joined
//! - Bounded, non-blocking outbound queues with slow-client eviction
//! - A grace window for reconnecting with the same token
//!
//! ### State Broadcasting
//! Every state change is pushed to the session's connected participants as a
//! JSON envelope, so clients never need to poll.
//!
//! ## Architecture Design
//!
//! ### One Task per Session
//! A session is an actor: one tokio task draining one event queue. Joins,
//! leaves, inputs and timer steps are applied strictly in order, which removes
//! the need for locks around game state.
//!
//! ### Cancellable Round Timers
//! Each round's countdown runs on its own task and reports back through the
//! session's queue. Rounds can be cancelled at any point; the session waits
//! for the timer task to exit and ignores anything a stale timer sent.
//!
//! ### WebSocket Transport
//! Clients talk over a single WebSocket carrying `{"type", "data"}` JSON
//! envelopes. A small HTTP surface creates sessions.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Per-connection outbound queue, session binding and the connection directory.
//!
//! ### Game Module (`game`)
//! Session state and rules: rotation queue, letter draws, scoring, standings.
//!
//! ### Session Module (`session`)
//! The session actor, its event enum and the cloneable handle used to reach it.
//!
//! ### Round Module (`round`)
//! The reveal and countdown timer task.
//!
//! ### Hub Module (`hub`)
//! Session and connection directories plus the inbound message dispatcher.
//!
//! ### Reconnect Module (`reconnect`)
//! Holds a disconnected participant's seat for a short grace window.
//!
//! ### Lexicon Module (`lexicon`)
//! Dictionary lookups: validity, prefix/suffix counts, best matches, scores.
//!
//! ### Network Module (`network`)
//! The axum router, WebSocket upgrade and per-socket reader/writer.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::hub::Hub;
//! use server::lexicon::WordList;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let words = WordList::load_or_empty(&config.words_path);
//!     let listener = tokio::net::TcpListener::bind(&config.address).await?;
//!
//!     let hub = Hub::new(config, Arc::new(words));
//!     server::network::serve(listener, hub).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod error;
pub mod game;
pub mod hub;
pub mod lexicon;
pub mod network;
pub mod reconnect;
pub mod round;
pub mod session;
