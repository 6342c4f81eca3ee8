//! Command-frame codec.
//!
//! All command frames start with a one-byte identifier. HELLO is an
//! unauthenticated broadcast; the update-form frames (HELLOACK, ACK,
//! UPDATE, UPDATEACK) are unicast and authenticated, with the trailing
//! broadcast-key field encrypted while the prefix stays in cleartext.
//! REFRESH is an authenticated broadcast carrying the identifier alone.

use crate::addr::{SHORT_ADDR_LEN, ShortAddr};
use crate::error::FrameError;
use apkes_crypto::{CHALLENGE_LEN, Challenge, KEY_LEN, Key128};

/// Command-frame identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    /// Broadcast neighbor discovery
    Hello = 0x0A,
    /// Responder's half of the handshake
    HelloAck = 0x0B,
    /// Initiator's key confirmation
    Ack = 0x0C,
    /// Keepalive probe
    Update = 0x0E,
    /// Keepalive response
    UpdateAck = 0x0F,
    /// Post-reboot rekey announcement
    Refresh = 0x10,
}

impl CommandId {
    /// Length of the `extra` field carried by this update-form frame
    #[must_use]
    pub fn extra_len(self) -> usize {
        match self {
            Self::HelloAck => CHALLENGE_LEN,
            _ => 0,
        }
    }
}

impl TryFrom<u8> for CommandId {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0A => Ok(Self::Hello),
            0x0B => Ok(Self::HelloAck),
            0x0C => Ok(Self::Ack),
            0x0E => Ok(Self::Update),
            0x0F => Ok(Self::UpdateAck),
            0x10 => Ok(Self::Refresh),
            other => Err(FrameError::UnknownIdentifier(other)),
        }
    }
}

/// HELLO payload: identifier, initiator challenge, sender short address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloFrame {
    /// Initiator's 8-byte challenge
    pub challenge: Challenge,
    /// Initiator's short address
    pub short_addr: ShortAddr,
}

/// Encoded HELLO payload length
pub const HELLO_LEN: usize = 1 + CHALLENGE_LEN + SHORT_ADDR_LEN;

impl HelloFrame {
    /// Encode the payload, identifier first
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HELLO_LEN);
        out.push(CommandId::Hello as u8);
        out.extend_from_slice(&self.challenge);
        out.extend_from_slice(&self.short_addr.to_le_bytes());
        out
    }

    /// Parse a HELLO payload.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::UnexpectedLength` on a malformed payload.
    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() != HELLO_LEN {
            return Err(FrameError::UnexpectedLength {
                expected: HELLO_LEN,
                actual: payload.len(),
            });
        }
        let mut challenge = [0u8; CHALLENGE_LEN];
        challenge.copy_from_slice(&payload[1..1 + CHALLENGE_LEN]);
        let short_addr = ShortAddr::from_le_bytes([
            payload[1 + CHALLENGE_LEN],
            payload[1 + CHALLENGE_LEN + 1],
        ]);
        Ok(Self {
            challenge,
            short_addr,
        })
    }
}

/// Update-form payload shared by HELLOACK, ACK, UPDATE and UPDATEACK:
/// identifier, optional extra data, sender short address, the index the
/// sender assigned to the receiver, and the optionally encrypted
/// broadcast key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFrame {
    /// Extra data (the responder challenge on HELLOACK)
    pub extra: Option<Challenge>,
    /// Sender's short address
    pub short_addr: ShortAddr,
    /// Index the sender assigned to the receiver
    pub receiver_index: u8,
    /// Sender's broadcast key, present when piggybacking is on
    pub broadcast_key: Option<Key128>,
}

impl UpdateFrame {
    fn expected_len(id: CommandId, with_broadcast_key: bool) -> usize {
        1 + id.extra_len() + SHORT_ADDR_LEN + 1 + if with_broadcast_key { KEY_LEN } else { 0 }
    }

    /// Number of cleartext prefix bytes when the trailing broadcast key
    /// is encrypted
    #[must_use]
    pub fn clear_prefix_len(payload_len: usize, with_broadcast_key: bool) -> usize {
        if with_broadcast_key {
            payload_len.saturating_sub(KEY_LEN)
        } else {
            payload_len
        }
    }

    /// Encode the payload for the given identifier
    #[must_use]
    pub fn encode(&self, id: CommandId) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::expected_len(id, self.broadcast_key.is_some()));
        out.push(id as u8);
        if let Some(extra) = &self.extra {
            out.extend_from_slice(extra);
        }
        out.extend_from_slice(&self.short_addr.to_le_bytes());
        out.push(self.receiver_index);
        if let Some(key) = &self.broadcast_key {
            out.extend_from_slice(key.as_bytes());
        }
        out
    }

    /// Parse a fully decrypted update-form payload.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::UnexpectedLength` on a malformed payload.
    pub fn parse(
        id: CommandId,
        payload: &[u8],
        with_broadcast_key: bool,
    ) -> Result<Self, FrameError> {
        let expected = Self::expected_len(id, with_broadcast_key);
        if payload.len() != expected {
            return Err(FrameError::UnexpectedLength {
                expected,
                actual: payload.len(),
            });
        }

        let mut at = 1;
        let extra = if id.extra_len() > 0 {
            let mut challenge = [0u8; CHALLENGE_LEN];
            challenge.copy_from_slice(&payload[at..at + CHALLENGE_LEN]);
            at += CHALLENGE_LEN;
            Some(challenge)
        } else {
            None
        };
        let short_addr = ShortAddr::from_le_bytes([payload[at], payload[at + 1]]);
        at += SHORT_ADDR_LEN;
        let receiver_index = payload[at];
        at += 1;
        let broadcast_key = if with_broadcast_key {
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&payload[at..at + KEY_LEN]);
            Some(Key128::new(key))
        } else {
            None
        };

        Ok(Self {
            extra,
            short_addr,
            receiver_index,
            broadcast_key,
        })
    }

    /// Parse the cleartext prefix of a HELLOACK before its trailing
    /// broadcast key has been decrypted: the responder challenge and the
    /// sender's short address, which select the verification key.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::TooShort` on a truncated payload.
    pub fn parse_helloack_prefix(payload: &[u8]) -> Result<(Challenge, ShortAddr), FrameError> {
        let needed = 1 + CHALLENGE_LEN + SHORT_ADDR_LEN;
        if payload.len() < needed {
            return Err(FrameError::TooShort {
                expected: needed,
                actual: payload.len(),
            });
        }
        let mut challenge = [0u8; CHALLENGE_LEN];
        challenge.copy_from_slice(&payload[1..1 + CHALLENGE_LEN]);
        let short_addr = ShortAddr::from_le_bytes([
            payload[1 + CHALLENGE_LEN],
            payload[1 + CHALLENGE_LEN + 1],
        ]);
        Ok((challenge, short_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let hello = HelloFrame {
            challenge: [0x11; 8],
            short_addr: ShortAddr::new(0x0001),
        };
        let bytes = hello.encode();
        assert_eq!(bytes.len(), HELLO_LEN);
        assert_eq!(bytes[0], 0x0A);
        assert_eq!(HelloFrame::parse(&bytes).unwrap(), hello);
    }

    #[test]
    fn test_hello_wrong_length_rejected() {
        assert!(matches!(
            HelloFrame::parse(&[0x0A; 5]),
            Err(FrameError::UnexpectedLength { .. })
        ));
    }

    #[test]
    fn test_helloack_roundtrip_with_broadcast_key() {
        let frame = UpdateFrame {
            extra: Some([0x22; 8]),
            short_addr: ShortAddr::new(0x0002),
            receiver_index: 3,
            broadcast_key: Some(Key128::new([0xAB; 16])),
        };
        let bytes = frame.encode(CommandId::HelloAck);
        assert_eq!(bytes.len(), 1 + 8 + 2 + 1 + 16);
        assert_eq!(bytes[0], 0x0B);
        assert_eq!(
            UpdateFrame::parse(CommandId::HelloAck, &bytes, true).unwrap(),
            frame
        );
    }

    #[test]
    fn test_ack_has_no_extra() {
        let frame = UpdateFrame {
            extra: None,
            short_addr: ShortAddr::new(0x0005),
            receiver_index: 0,
            broadcast_key: None,
        };
        let bytes = frame.encode(CommandId::Ack);
        assert_eq!(bytes.len(), 4);
        assert_eq!(UpdateFrame::parse(CommandId::Ack, &bytes, false).unwrap(), frame);
    }

    #[test]
    fn test_clear_prefix_excludes_broadcast_key() {
        let frame = UpdateFrame {
            extra: Some([0x33; 8]),
            short_addr: ShortAddr::new(0x0002),
            receiver_index: 1,
            broadcast_key: Some(Key128::new([0xCD; 16])),
        };
        let bytes = frame.encode(CommandId::HelloAck);
        assert_eq!(UpdateFrame::clear_prefix_len(bytes.len(), true), bytes.len() - 16);
        assert_eq!(UpdateFrame::clear_prefix_len(bytes.len(), false), bytes.len());
    }

    #[test]
    fn test_helloack_prefix_readable_before_decryption() {
        let frame = UpdateFrame {
            extra: Some([0x44; 8]),
            short_addr: ShortAddr::new(0xBEEF),
            receiver_index: 7,
            broadcast_key: Some(Key128::new([0xEE; 16])),
        };
        let mut bytes = frame.encode(CommandId::HelloAck);
        // Scramble the encrypted tail; the prefix must still parse.
        for b in bytes.iter_mut().rev().take(16) {
            *b ^= 0x5A;
        }
        let (challenge, short) = UpdateFrame::parse_helloack_prefix(&bytes).unwrap();
        assert_eq!(challenge, [0x44; 8]);
        assert_eq!(short, ShortAddr::new(0xBEEF));
    }

    #[test]
    fn test_unknown_identifier() {
        assert_eq!(
            CommandId::try_from(0x0D),
            Err(FrameError::UnknownIdentifier(0x0D))
        );
        assert_eq!(CommandId::try_from(0x0A), Ok(CommandId::Hello));
        assert_eq!(CommandId::try_from(0x10), Ok(CommandId::Refresh));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_id() -> impl Strategy<Value = CommandId> {
            prop::sample::select(vec![
                CommandId::HelloAck,
                CommandId::Ack,
                CommandId::Update,
                CommandId::UpdateAck,
            ])
        }

        proptest! {
            #[test]
            fn prop_update_form_roundtrip(
                id in arb_id(),
                extra in any::<[u8; 8]>(),
                short in any::<u16>(),
                index in any::<u8>(),
                bk in proptest::option::of(any::<[u8; 16]>())
            ) {
                let frame = UpdateFrame {
                    extra: (id.extra_len() > 0).then_some(extra),
                    short_addr: ShortAddr::new(short),
                    receiver_index: index,
                    broadcast_key: bk.map(Key128::new),
                };
                let with_bk = frame.broadcast_key.is_some();
                let bytes = frame.encode(id);
                prop_assert_eq!(UpdateFrame::parse(id, &bytes, with_bk).unwrap(), frame);
            }

            #[test]
            fn prop_parse_never_panics(payload in proptest::collection::vec(any::<u8>(), 0..64)) {
                let _ = HelloFrame::parse(&payload);
                let _ = UpdateFrame::parse(CommandId::Update, &payload, true);
                let _ = UpdateFrame::parse_helloack_prefix(&payload);
            }
        }
    }
}
