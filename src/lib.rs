//! Cache-first track resolution and Lavalink node supervision.
//!
//! See [`service::AudioService`] for the entry point.

pub mod audio;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod service;
pub mod sources;
pub mod storage;

pub use context::{GuildId, RequestContext, RequestId, UserId};
pub use error::AudioError;
pub use service::{AudioService, PlayReport};
