//! Channel lifecycle.
//!
//! ```text
//! Handshaking ──► Established ──► Closed
//!      │                             ▲
//!      └──────► Failed(code) ────────┘
//! ```
//!
//! Failed and Closed are final for handshaking purposes; retry means a new channel.

use thiserror::Error;

use super::ChannelErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Handshaking,
    Established,
    Failed(ChannelErrorCode),
    Closed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid channel transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ChannelPhase,
    pub to: ChannelPhase,
}

impl ChannelPhase {
    pub fn is_handshaking(self) -> bool {
        self == ChannelPhase::Handshaking
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelPhase::Failed(_) | ChannelPhase::Closed)
    }

    /// Applies `next` if the lifecycle allows it.
    pub fn transition(&mut self, next: ChannelPhase) -> Result<(), InvalidTransition> {
        let allowed = match (*self, next) {
            (ChannelPhase::Handshaking, ChannelPhase::Established) => true,
            (ChannelPhase::Handshaking, ChannelPhase::Failed(_)) => true,
            (ChannelPhase::Closed, _) => false,
            (_, ChannelPhase::Closed) => true,
            _ => false,
        };
        if !allowed {
            return Err(InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}
