//! # Audio Module
//!
//! Everything that talks to, or stands in front of, the Lavalink node.
//!
//! ## Components
//!
//! ### [`supervisor`] - Node Connection
//! - Bounded-retry startup of a managed node or connection to an external one
//! - Handshake with per-attempt timeout, restart on timeout in managed mode
//! - Player restore after every (re)connection
//!
//! ### [`managed`] / [`lavalink`] - Node Plumbing
//! - `java -jar Lavalink.jar` launched and reaped locally
//! - Lavalink v4 REST: handshake, track loading, player updates
//!
//! ### [`player`] / [`enqueue`] - Live Queues
//! - One FIFO queue per guild, shared through [`player::PlayerRegistry`]
//! - Guild policy applied on enqueue: allow lists, track length, queue size
//!
//! ## States
//!
//! ```text
//! Disconnected ──► Starting ──► Connected
//!       ▲              │            │
//!       └──── link ────┼────────────┘
//!            dropped   ▼
//!                   Aborted (until restart)
//! ```

pub mod enqueue;
pub mod lavalink;
pub mod managed;
pub mod node;
pub mod player;
pub mod supervisor;
pub mod track;
