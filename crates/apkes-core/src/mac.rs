//! The MAC contract the core consumes.
//!
//! The core builds and seals one frame at a time and hands it to the
//! radio fire-and-forget. On receive, the embedding feeds frames into
//! [`crate::Apkes::on_frame`]; the core performs its own sender lookup.

use crate::addr::ExtendedAddr;
use apkes_crypto::{Mic, SecurityLevel};

/// Frame destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dst {
    /// All one-hop neighbors
    Broadcast,
    /// A single peer, addressed by extended address
    Unicast(ExtendedAddr),
}

/// One command frame as it crosses the radio.
///
/// Sealing happens before handoff, so the security level, the sender
/// frame counter and the MIC travel alongside the payload the way the
/// auxiliary security header does on the air. Authenticated broadcasts
/// carry one MIC per receiver in `broadcast_mics`, ordered by the index
/// the sender assigned to each receiver.
#[derive(Debug, Clone)]
pub struct WireFrame {
    /// Sender extended address
    pub src: ExtendedAddr,
    /// Destination
    pub dst: Dst,
    /// Security level applied to the payload
    pub level: SecurityLevel,
    /// Sender's frame counter at transmission
    pub frame_counter: u32,
    /// Command payload, identifier first; the tail is ciphertext when the
    /// level carries the encryption bit
    pub payload: Vec<u8>,
    /// MIC for secured unicast frames
    pub mic: Option<Mic>,
    /// Per-receiver MICs for secured broadcasts, indexed by the
    /// receiver's foreign index
    pub broadcast_mics: Vec<Mic>,
}

/// Radio transmit capability, fire-and-forget, one frame outstanding
pub trait Mac {
    /// Hand a sealed frame to the radio
    fn send(&mut self, frame: WireFrame);
}
