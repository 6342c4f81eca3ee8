//! # APKES Core
//!
//! Adaptable Pairwise Key Establishment Scheme for constrained-node
//! wireless networks. On bootstrap a node discovers its one-hop
//! neighborhood through Trickled HELLO broadcasts, negotiates a symmetric
//! pairwise key with each neighbor through an authenticated three-way
//! handshake, and afterwards keeps those keys alive, persisted, and
//! refreshed across reboots.
//!
//! This crate provides:
//! - **Command-frame codec**: HELLO, HELLOACK, ACK, UPDATE, UPDATEACK and
//!   REFRESH byte layouts with the cleartext-prefix split for encrypted
//!   broadcast-key piggybacking
//! - **Neighbor table**: bounded slot pool with dense one-byte local
//!   indices, expiry, and generation-checked handles
//! - **Handshake engine**: the HELLO / HELLOACK / ACK state machine with
//!   per-peer random wait windows and a bounded wait-timer pool
//! - **Trickle scheduler**: interval-doubling HELLO emission with
//!   density-triggered resets and bootstrap-completion signalling
//! - **Keepalive loop**: lazy UPDATE/UPDATEACK probing under capacity
//!   pressure
//! - **Reboot rekey**: table restore from flash plus REFRESH broadcasts
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     Apkes (event loop)                    │
//! │   handshake · trickle · keepalive · refresh · timers      │
//! ├───────────────────────────────────────────────────────────┤
//! │   NeighborTable        KeyingScheme        NonVolatile    │
//! │   (bounded pool)       (pre-secrets)       (flash image)  │
//! ├───────────────────────────────────────────────────────────┤
//! │                  Mac (radio, fire-and-forget)             │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The core is a single-threaded, timer-driven state machine: every state
//! mutation happens inside [`Apkes::on_frame`] or a timer expiration
//! delivered by [`Apkes::poll_timers`]. [`driver::Driver`] funnels both
//! into one tokio task.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod apkes;
pub mod config;
pub mod driver;
pub mod error;
pub mod frame;
pub mod keepalive;
pub mod mac;
pub mod neighbor;
pub mod scheme;
pub mod timer;
pub mod trickle;

pub use addr::{ExtendedAddr, NeighborIds, ShortAddr};
pub use apkes::{Apkes, BootstrapCallback, LinkSecurity, Platform};
pub use config::Config;
pub use driver::{Driver, TokioClock};
pub use error::{Discard, FrameError};
pub use frame::{CommandId, HelloFrame, UpdateFrame};
pub use mac::{Dst, Mac, WireFrame};
pub use neighbor::{Neighbor, NeighborHandle, NeighborStatus, NeighborTable};
pub use scheme::{FixedSecretScheme, KeyingScheme, MasterKeyScheme};
pub use timer::{Clock, MonotonicClock};
pub use trickle::TrickleState;
