use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(GuildId);
id_type!(UserId);
id_type!(RequestId);

/// Contexto de una acción iniciada por un usuario.
///
/// The host dispatcher hands out one `request_id` per user action; every
/// cache write staged while serving that action is keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub guild_id: GuildId,
    pub requester: UserId,
}

impl RequestContext {
    pub fn new(request_id: u64, guild_id: u64, requester: u64) -> Self {
        Self {
            request_id: RequestId(request_id),
            guild_id: GuildId(guild_id),
            requester: UserId(requester),
        }
    }
}
