//! Line-delimited JSON frames exchanged between remote channels and the broker.

use serde::{Deserialize, Serialize};

use crate::ipc::event::{Event, EventKind};
use crate::ipc::ChannelError;

/// One frame on the broker socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum Frame {
    /// First frame a remote channel sends; names the channel.
    Hello { channel: String },
    Subscribe { kind: EventKind },
    Unsubscribe { kind: EventKind },
    Publish { event: Event },
    /// Broker to channel: an event published by `origin`.
    Deliver { origin: String, event: Event },
}

/// Encode a frame as a single newline-terminated line.
pub(crate) fn encode(frame: &Frame) -> Result<String, ChannelError> {
    let mut line =
        serde_json::to_string(frame).map_err(|e| ChannelError::Transport(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

pub(crate) fn decode(line: &str) -> Result<Frame, ChannelError> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| ChannelError::Transport(format!("malformed frame: {}", e)))
}
