use std::{fmt, num::ParseIntError, str::FromStr};

use serde::{Deserialize, Serialize};
use shroud_utils::{constants::PUBLIC_KEY_SIZE, CiphertextBlock, Nonce};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EventParseError>;

/// Separator between the event name and the computation offset in the
/// textual form of a [`ChannelKey`]
const OFFSET_SEPARATOR: char = '@';

/// Identity of a result channel.
///
/// A key with a computation offset only matches events emitted for that
/// computation; a key without one matches every event with the same name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ChannelKey {
    /// Name of the event emitted when the computation is finalized
    pub event_name: String,
    /// Request identifier the event must carry, if any
    pub computation_offset: Option<u64>,
}

impl ChannelKey {
    #[must_use]
    pub fn named(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            computation_offset: None,
        }
    }

    #[must_use]
    pub fn for_computation(event_name: impl Into<String>, computation_offset: u64) -> Self {
        Self {
            event_name: event_name.into(),
            computation_offset: Some(computation_offset),
        }
    }

    /// Returns true if `event` should be delivered to a listener on this channel
    #[must_use]
    pub fn matches(&self, event: &ResultEvent) -> bool {
        if self.event_name != event.event_name {
            return false;
        }
        match self.computation_offset {
            Some(offset) => event.computation_offset == Some(offset),
            None => true,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.computation_offset {
            Some(offset) => write!(f, "{}{OFFSET_SEPARATOR}{offset}", self.event_name),
            None => f.write_str(&self.event_name),
        }
    }
}

impl FromStr for ChannelKey {
    type Err = EventParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (event_name, offset) = match s.split_once(OFFSET_SEPARATOR) {
            Some((name, offset)) => (name, Some(offset.parse::<u64>()?)),
            None => (s, None),
        };
        if event_name.is_empty() {
            return Err(EventParseError::InvalidChannelKey(s.to_string()));
        }
        Ok(Self {
            event_name: event_name.to_string(),
            computation_offset: offset,
        })
    }
}

/// A finalized computation's notification, as delivered on a result channel
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ResultEvent {
    /// Name of the emitted event
    pub event_name: String,
    /// Identifier of the computation that produced this event, when the
    /// emitter includes it
    pub computation_offset: Option<u64>,
    /// Event body
    pub payload: ResultPayload,
}

impl ResultEvent {
    /// Parses an event from its JSON representation
    ///
    /// # Errors
    ///
    /// Returns `EventParseError::Json` if the value does not describe a result event
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Body of a [`ResultEvent`]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultPayload {
    /// Ciphertext re-encrypted for the requester or a designated observer.
    ///
    /// `nonce` is present when the cluster picked a fresh nonce for the
    /// output; when absent, the recipient's own request nonce applies.
    Encrypted {
        encryption_key: Option<[u8; PUBLIC_KEY_SIZE]>,
        nonce: Option<Nonce>,
        ciphertexts: Vec<CiphertextBlock>,
    },
    /// Values the computation chose to reveal in the clear
    Revealed {
        fields: serde_json::Map<String, serde_json::Value>,
    },
    /// The computation did not produce an output
    Aborted { reason: String },
}

#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("Invalid channel key: `{0}`")]
    InvalidChannelKey(String),
    #[error("Invalid computation offset: {0}")]
    InvalidOffset(#[from] ParseIntError),
    #[error("Invalid event payload: {0}")]
    Json(#[from] serde_json::Error),
}
