//! Handshake and verification flags of an untrusted peer connection.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::StateError;
use crate::wire::message::PROTOCOL_VERSION;

/// Time allowed from connecting to completing the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for the verification headers to arrive.
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct UntrustedState {
    pub connected_time: Option<Instant>,
    pub version_received: bool,
    pub protocol_version: u32,
    pub handshake_complete: bool,
    pub addresses_requested: bool,
    pub mempool_requested: bool,
    pub headers_requested: Option<Instant>,
    /// The peer is on the same chain as the trusted node.
    pub verified: bool,
    /// The verification bonus was applied to the peer's score.
    pub score_updated: bool,
}

impl Default for UntrustedState {
    fn default() -> Self {
        Self {
            connected_time: None,
            version_received: false,
            protocol_version: PROTOCOL_VERSION,
            handshake_complete: false,
            addresses_requested: false,
            mempool_requested: false,
            headers_requested: None,
            verified: false,
            score_updated: false,
        }
    }
}

impl UntrustedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.verified
    }

    pub fn mark_connected(&mut self) {
        self.connected_time = Some(Instant::now());
    }

    pub fn mark_headers_requested(&mut self) {
        self.headers_requested = Some(Instant::now());
    }

    pub fn clear_headers_requested(&mut self) {
        self.headers_requested = None;
    }

    pub fn check_timeouts(&self) -> Result<(), StateError> {
        let now = Instant::now();
        if !self.handshake_complete {
            if let Some(connected) = self.connected_time {
                if now.duration_since(connected) > HANDSHAKE_TIMEOUT {
                    return Err(StateError::HandshakeTimeout);
                }
            }
        }
        if !self.verified {
            if let Some(requested) = self.headers_requested {
                if now.duration_since(requested) > VERIFY_TIMEOUT {
                    return Err(StateError::HeadersTimeout);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let mut state = UntrustedState::new();
        assert_eq!(state.check_timeouts(), Ok(()));

        state.mark_connected();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(state.check_timeouts(), Ok(()));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(state.check_timeouts(), Err(StateError::HandshakeTimeout));

        state.handshake_complete = true;
        assert_eq!(state.check_timeouts(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_timeout() {
        let mut state = UntrustedState::new();
        state.mark_connected();
        state.handshake_complete = true;
        state.mark_headers_requested();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(state.check_timeouts(), Err(StateError::HeadersTimeout));

        state.verified = true;
        assert!(state.is_ready());
        assert_eq!(state.check_timeouts(), Ok(()));
    }
}
