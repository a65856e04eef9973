//! Per-channel authentication gate (spec §4.3). A channel starts
//! `UNAUTHED`; only the reserved `AUTH` command is accepted until an
//! [`AuthChecker`] grants it `AUTHED`. There is no reverse transition —
//! dropping the channel is the only way back to unauthenticated.

use serde::{Deserialize, Serialize};

use crate::channel::{AttrValue, RemotingChannel};
use crate::command::TenuredCommand;
use crate::error::TenuredError;

const AUTH_ATTRIBUTE: &str = "auth_token";

/// The payload handed back to a client on a successful AUTH handshake,
/// identifying which module/address accepted the connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthHeader {
    pub module: String,
    pub address: String,
}

impl AuthHeader {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("AuthHeader is always serializable")
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Validates AUTH commands and tracks per-channel auth state.
///
/// Implementations may parse arbitrary credentials out of the command's
/// `header`/`body`; the default implementation only checks that a header is
/// present, matching the original's `defAuthChecker` (see
/// `examples/original_source/commons/protocol/tenured_auth.go`).
pub trait AuthChecker: Send + Sync {
    /// Attempt to authenticate `channel` using `command` (the AUTH request).
    /// On success, implementations must mark the channel authed (e.g. via
    /// [`DefaultAuthChecker::mark_authed`] or their own bookkeeping) before
    /// returning `Ok`.
    fn auth(&self, channel: &RemotingChannel, command: &TenuredCommand) -> Result<(), TenuredError>;

    /// Whether `channel` has completed the AUTH handshake.
    fn is_authed(&self, channel: &RemotingChannel) -> bool;
}

/// The default checker: any AUTH command with a non-empty header succeeds.
/// Real deployments supply their own [`AuthChecker`] that actually validates
/// credentials parsed from the command header.
#[derive(Default)]
pub struct DefaultAuthChecker;

impl DefaultAuthChecker {
    pub fn mark_authed(channel: &RemotingChannel) {
        channel
            .attributes()
            .insert(AUTH_ATTRIBUTE.to_string(), AttrValue::Str("true".to_string()));
    }
}

impl AuthChecker for DefaultAuthChecker {
    fn auth(&self, channel: &RemotingChannel, command: &TenuredCommand) -> Result<(), TenuredError> {
        if command.header.is_empty() {
            return Err(TenuredError::InvalidAuth);
        }
        Self::mark_authed(channel);
        Ok(())
    }

    fn is_authed(&self, channel: &RemotingChannel) -> bool {
        channel.attributes().contains_key(AUTH_ATTRIBUTE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::sink;

    fn test_channel() -> RemotingChannel {
        RemotingChannel::new("test".to_string(), Box::new(sink()))
    }

    #[test]
    fn empty_header_is_rejected() {
        let checker = DefaultAuthChecker;
        let channel = test_channel();
        let cmd = TenuredCommand::request(1, crate::command::REQUEST_CODE_AUTH, vec![], vec![]);
        assert!(matches!(checker.auth(&channel, &cmd), Err(TenuredError::InvalidAuth)));
        assert!(!checker.is_authed(&channel));
    }

    #[test]
    fn non_empty_header_marks_channel_authed() {
        let checker = DefaultAuthChecker;
        let channel = test_channel();
        let cmd = TenuredCommand::request(1, crate::command::REQUEST_CODE_AUTH, b"token".to_vec(), vec![]);
        assert!(checker.auth(&channel, &cmd).is_ok());
        assert!(checker.is_authed(&channel));
    }

    #[test]
    fn auth_header_roundtrips_through_json() {
        let header = AuthHeader {
            module: "store".to_string(),
            address: "127.0.0.1:9000".to_string(),
        };
        let bytes = header.encode();
        assert_eq!(AuthHeader::decode(&bytes), Some(header));
    }
}
