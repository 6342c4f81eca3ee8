//! The APKES event loop.
//!
//! One [`Apkes`] value holds everything the subsystem owns: the neighbor
//! table, the Trickle counters, the pending-timer queue, the PRNG, and
//! the capabilities supplied by the platform (radio, keying scheme,
//! flash, clock). Every state mutation happens inside [`Apkes::on_frame`]
//! or a timer expiration delivered through [`Apkes::poll_timers`]; the
//! embedding must serialize both onto one event loop.

use crate::addr::{ExtendedAddr, NeighborIds, ShortAddr};
use crate::config::Config;
use crate::error::Discard;
use crate::frame::{CommandId, HelloFrame, UpdateFrame};
use crate::keepalive::{UpdateDecision, UpdatePass, update_decision};
use crate::mac::{Dst, Mac, WireFrame};
use crate::neighbor::{Neighbor, NeighborHandle, NeighborStatus, NeighborTable};
use crate::scheme::KeyingScheme;
use crate::timer::{Clock, TimerEvent, TimerKey, TimerQueue};
use crate::trickle::TrickleState;
use apkes_crypto::{
    AntiReplay, CHALLENGE_LEN, Challenge, FrameNonce, KEY_LEN, Key128, MIC_LEN, Mic, Prng,
    SecurityLevel, derive_pairwise_key, open, rekey_after_reboot, seal,
};
use apkes_store::{NeighborRecord, NonVolatile, backup_neighbors, restore_neighbors};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One-shot bootstrap-completion callback
pub type BootstrapCallback = Box<dyn FnOnce()>;

/// The capability set a node's environment supplies
pub struct Platform {
    /// Radio transmit path
    pub mac: Box<dyn Mac>,
    /// Pre-secret provider
    pub scheme: Box<dyn KeyingScheme>,
    /// Non-volatile storage
    pub flash: Box<dyn NonVolatile>,
    /// Monotonic time source
    pub clock: Box<dyn Clock>,
    /// Cryptographically seeded PRNG
    pub prng: Prng,
}

/// The link-layer security driver surface exposed to the stack above
pub trait LinkSecurity {
    /// Whether the bootstrap callback has been delivered (or none is
    /// pending)
    fn is_bootstrapped(&self) -> bool;

    /// Start the subsystem; `on_bootstrapped` fires exactly once when
    /// the first HELLO cycle acquired a neighbor or the restored table
    /// was rekeyed
    fn bootstrap(&mut self, on_bootstrapped: BootstrapCallback);

    /// Deliver a received command frame
    fn on_frame(&mut self, frame: WireFrame);
}

/// The APKES subsystem state machine
pub struct Apkes {
    config: Config,
    own_ids: NeighborIds,
    mac: Box<dyn Mac>,
    scheme: Box<dyn KeyingScheme>,
    flash: Box<dyn NonVolatile>,
    clock: Box<dyn Clock>,
    prng: Prng,
    neighbors: NeighborTable,
    timers: TimerQueue,
    trickle: TrickleState,
    update_pass: Option<UpdatePass>,
    /// Outstanding HELLO answer delays; bounded by `max_tentative`
    wait_timers_in_use: usize,
    /// The challenge carried in our most recent HELLO
    our_challenge: Challenge,
    /// Key our own authenticated broadcasts are built around
    broadcast_key: Key128,
    frame_counter: u32,
    on_bootstrapped: Option<BootstrapCallback>,
    refresh_remaining: u8,
    /// Delay that preceded the most recent HELLO, for interval bookkeeping
    last_hello_delay: Duration,
    trickle_timer: Option<TimerKey>,
    hello_timer: Option<TimerKey>,
}

impl Apkes {
    /// Assemble the subsystem; nothing runs until [`Apkes::bootstrap`]
    #[must_use]
    pub fn new(config: Config, own_ids: NeighborIds, platform: Platform) -> Self {
        let Platform {
            mac,
            scheme,
            flash,
            clock,
            mut prng,
        } = platform;
        let broadcast_key = prng.key();
        let max_neighbors = config.max_neighbors;
        Self {
            config,
            own_ids,
            mac,
            scheme,
            flash,
            clock,
            prng,
            neighbors: NeighborTable::new(max_neighbors),
            timers: TimerQueue::new(),
            trickle: TrickleState::new(),
            update_pass: None,
            wait_timers_in_use: 0,
            our_challenge: [0u8; CHALLENGE_LEN],
            broadcast_key,
            frame_counter: 0,
            on_bootstrapped: None,
            refresh_remaining: 0,
            last_hello_delay: Duration::ZERO,
            trickle_timer: None,
            hello_timer: None,
        }
    }

    /// Our own identity pair
    #[must_use]
    pub fn own_ids(&self) -> NeighborIds {
        self.own_ids
    }

    /// The configuration the subsystem runs with
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Read access to the neighbor table
    #[must_use]
    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// Read access to the Trickle counters
    #[must_use]
    pub fn trickle_state(&self) -> &TrickleState {
        &self.trickle
    }

    /// Earliest pending timer deadline, for the embedding's sleep
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    /// Fire every timer whose deadline has passed
    pub fn poll_timers(&mut self) {
        let now = self.clock.now();
        while let Some(event) = self.timers.pop_due(now) {
            self.dispatch(event);
        }
    }

    /// Whether the bootstrap callback has been delivered
    #[must_use]
    pub fn is_bootstrapped(&self) -> bool {
        self.on_bootstrapped.is_none()
    }

    /// Start the subsystem: restore and rekey the persisted table,
    /// announce the reboot, and begin the HELLO cycle.
    pub fn bootstrap(&mut self, on_bootstrapped: BootstrapCallback) {
        self.on_bootstrapped = Some(on_bootstrapped);
        if let Err(err) = self.scheme.init(self.flash.as_mut()) {
            warn!(%err, "keying scheme init failed");
        }

        let restored = self.restore_from_flash();
        info!(restored, addr = %self.own_ids.extended_addr, "bootstrapping");

        let now = self.clock.now();
        self.timers.schedule(
            now + self.config.update_check_interval,
            TimerEvent::UpdateCheck,
        );

        if restored > 0 {
            if self.config.with_broadcast_keys {
                self.refresh_remaining = self.config.refresh_count;
                self.on_refresh_broadcast();
            } else {
                // No authenticated broadcasts available; the restored
                // table alone completes bootstrap.
                self.backup_to_flash();
                self.finish_bootstrap_now();
            }
        }

        self.trickle_fire();
    }

    /// Stop the Trickle scheduler: cancel both of its timers, then
    /// evaluate bootstrap completion so a pending caller is not stranded.
    pub fn stop(&mut self) {
        self.trickle_stop();
    }

    /// Deliver a received command frame.
    ///
    /// Adversarial and malformed input is dropped here; nothing in this
    /// path fails the caller.
    pub fn on_frame(&mut self, mut frame: WireFrame) {
        if frame.src == self.own_ids.extended_addr {
            return;
        }
        let Some(&id_byte) = frame.payload.first() else {
            debug!(src = %frame.src, "dropping empty command frame");
            return;
        };
        let result = match CommandId::try_from(id_byte) {
            Ok(CommandId::Hello) => self.on_hello(&frame),
            Ok(CommandId::HelloAck) => self.on_helloack(&mut frame),
            Ok(CommandId::Ack) => self.on_ack(&mut frame),
            Ok(CommandId::Update) => self.on_update(&mut frame),
            Ok(CommandId::UpdateAck) => self.on_updateack(&mut frame),
            Ok(CommandId::Refresh) => self.on_refresh(&frame),
            Err(err) => {
                debug!(src = %frame.src, %err, "dropping command frame");
                return;
            }
        };
        if let Err(reason) = result {
            debug!(src = %frame.src, id = id_byte, %reason, "dropping command frame");
        }
    }

    // ------------------------------------------------------------------
    // Handshake engine
    // ------------------------------------------------------------------

    fn on_hello(&mut self, frame: &WireFrame) -> Result<(), Discard> {
        let hello = HelloFrame::parse(&frame.payload)?;

        if self.wait_timers_in_use >= self.config.max_tentative {
            return Err(Discard::CapacityExhausted);
        }
        if self.neighbors.lookup(&frame.src).is_some() {
            // A second HELLO from a known peer is silently ignored.
            return Err(Discard::UnexpectedSender);
        }

        let now = self.clock.now();
        let Some(handle) = self.neighbors.allocate(now) else {
            return Err(Discard::CapacityExhausted);
        };

        let our_challenge = self.prng.challenge();
        let wait = self.prng.uniform_duration(self.config.max_waiting_period);
        let expiration = now + self.config.hello_duration();
        if let Some(n) = self.neighbors.get_mut(handle) {
            n.status = NeighborStatus::Tentative;
            n.ids = NeighborIds::new(frame.src, hello.short_addr);
            n.metadata[..CHALLENGE_LEN].copy_from_slice(&hello.challenge);
            n.metadata[CHALLENGE_LEN..].copy_from_slice(&our_challenge);
            n.expiration_time = expiration;
        }

        self.wait_timers_in_use += 1;
        self.timers
            .schedule(now + wait, TimerEvent::HelloAckWait(handle));
        debug!(src = %frame.src, ?wait, "HELLO accepted");
        Ok(())
    }

    fn on_wait_expired(&mut self, handle: NeighborHandle) {
        self.wait_timers_in_use = self.wait_timers_in_use.saturating_sub(1);

        let Some(n) = self.neighbors.get_mut(handle) else {
            // The tentative entry expired or was evicted meanwhile.
            return;
        };
        if n.status != NeighborStatus::Tentative {
            debug!("suppressing HELLOACK");
            return;
        }
        n.status = NeighborStatus::TentativeAwaitingAck;
        let ids = n.ids;
        let metadata = n.metadata;

        let Some(secret) = self.scheme.secret_with_hello_sender(&ids) else {
            debug!(peer = %ids.extended_addr, "no secret with HELLO sender");
            return;
        };
        let mut initiator = [0u8; CHALLENGE_LEN];
        initiator.copy_from_slice(&metadata[..CHALLENGE_LEN]);
        let mut responder = [0u8; CHALLENGE_LEN];
        responder.copy_from_slice(&metadata[CHALLENGE_LEN..]);
        let key = derive_pairwise_key(&secret, &initiator, &responder);

        if let Some(n) = self.neighbors.get_mut(handle) {
            n.pairwise_key = key.clone();
        }
        self.send_update_command(CommandId::HelloAck, handle, Some(responder), &key);
    }

    fn on_helloack(&mut self, frame: &mut WireFrame) -> Result<(), Discard> {
        let (responder_challenge, short_addr) =
            UpdateFrame::parse_helloack_prefix(&frame.payload)?;
        let ids = NeighborIds::new(frame.src, short_addr);

        let Some(secret) = self.scheme.secret_with_helloack_sender(&ids) else {
            return Err(Discard::SchemeNoSecret);
        };
        let key = derive_pairwise_key(&secret, &self.our_challenge, &responder_challenge);
        self.open_unicast(&key, frame)?;

        let handle = match self.neighbors.lookup(&frame.src) {
            Some(handle) => {
                let n = self.neighbors.get_mut(handle).ok_or(Discard::BadState)?;
                match n.status {
                    NeighborStatus::Permanent => {
                        if n.anti_replay.was_replayed(frame.frame_counter) {
                            return Err(Discard::Replay);
                        }
                        handle
                    }
                    // We answered the peer's HELLO concurrently; accept
                    // its HELLOACK to our own HELLO anyway.
                    NeighborStatus::Tentative => handle,
                    NeighborStatus::TentativeAwaitingAck => return Err(Discard::BadState),
                }
            }
            None => self
                .neighbors
                .allocate(self.clock.now())
                .ok_or(Discard::CapacityExhausted)?,
        };

        let form = UpdateFrame::parse(
            CommandId::HelloAck,
            &frame.payload,
            self.config.with_broadcast_keys,
        )?;
        if let Some(n) = self.neighbors.get_mut(handle) {
            n.pairwise_key = key.clone();
        }
        self.finish_update(handle, ids, &form, frame.frame_counter);
        self.send_update_command(CommandId::Ack, handle, None, &key);
        Ok(())
    }

    fn on_ack(&mut self, frame: &mut WireFrame) -> Result<(), Discard> {
        let handle = self
            .neighbors
            .lookup(&frame.src)
            .ok_or(Discard::UnexpectedSender)?;
        let key = {
            let n = self.neighbors.get(handle).ok_or(Discard::UnexpectedSender)?;
            if n.status != NeighborStatus::TentativeAwaitingAck {
                return Err(Discard::BadState);
            }
            n.pairwise_key.clone()
        };
        self.open_unicast(&key, frame)?;

        let form = UpdateFrame::parse(
            CommandId::Ack,
            &frame.payload,
            self.config.with_broadcast_keys,
        )?;
        let ids = NeighborIds::new(frame.src, form.short_addr);
        self.finish_update(handle, ids, &form, frame.frame_counter);
        Ok(())
    }

    fn on_update(&mut self, frame: &mut WireFrame) -> Result<(), Discard> {
        let handle = self
            .neighbors
            .lookup(&frame.src)
            .ok_or(Discard::UnexpectedSender)?;
        let key = self
            .neighbors
            .get(handle)
            .ok_or(Discard::UnexpectedSender)?
            .pairwise_key
            .clone();
        self.open_unicast(&key, frame)?;
        if let Some(n) = self.neighbors.get_mut(handle) {
            if n.anti_replay.was_replayed(frame.frame_counter) {
                return Err(Discard::Replay);
            }
        }

        let form = UpdateFrame::parse(
            CommandId::Update,
            &frame.payload,
            self.config.with_broadcast_keys,
        )?;
        // Answer before prolonging so the peer's wait is as short as the
        // radio allows.
        self.send_update_command(CommandId::UpdateAck, handle, None, &key);
        let ids = NeighborIds::new(frame.src, form.short_addr);
        self.finish_update(handle, ids, &form, frame.frame_counter);
        Ok(())
    }

    fn on_updateack(&mut self, frame: &mut WireFrame) -> Result<(), Discard> {
        let handle = self
            .neighbors
            .lookup(&frame.src)
            .ok_or(Discard::UnexpectedSender)?;
        let key = self
            .neighbors
            .get(handle)
            .ok_or(Discard::UnexpectedSender)?
            .pairwise_key
            .clone();
        self.open_unicast(&key, frame)?;
        if let Some(n) = self.neighbors.get_mut(handle) {
            if n.anti_replay.was_replayed(frame.frame_counter) {
                return Err(Discard::Replay);
            }
        }

        let form = UpdateFrame::parse(
            CommandId::UpdateAck,
            &frame.payload,
            self.config.with_broadcast_keys,
        )?;
        let ids = NeighborIds::new(frame.src, form.short_addr);
        self.finish_update(handle, ids, &form, frame.frame_counter);
        Ok(())
    }

    fn on_refresh(&mut self, frame: &WireFrame) -> Result<(), Discard> {
        let handle = self
            .neighbors
            .lookup(&frame.src)
            .ok_or(Discard::UnexpectedSender)?;
        let (foreign_index, rekeyed) = {
            let n = self.neighbors.get(handle).ok_or(Discard::UnexpectedSender)?;
            if n.status != NeighborStatus::Permanent {
                return Err(Discard::BadState);
            }
            (n.foreign_index, rekey_after_reboot(&n.pairwise_key))
        };

        // Verify under the tentatively rekeyed key. A repeated or forged
        // REFRESH fails here and the stored key stays untouched, which
        // makes the rekey idempotent across the M_REFRESH broadcasts.
        let mic = *frame
            .broadcast_mics
            .get(foreign_index as usize)
            .ok_or(Discard::CryptoReject)?;
        let nonce = FrameNonce::new(frame.src.as_bytes(), frame.frame_counter, frame.level);
        let mut payload = frame.payload.clone();
        let clear_len = payload.len();
        open(&rekeyed, &nonce, clear_len, &mut payload, &mic)
            .map_err(|_| Discard::CryptoReject)?;

        if let Some(n) = self.neighbors.get_mut(handle) {
            n.pairwise_key = rekeyed;
            let mut anti_replay = AntiReplay::new();
            anti_replay.init(frame.frame_counter);
            n.anti_replay = anti_replay;
        }
        self.backup_to_flash();
        info!(peer = %frame.src, "pairwise key refreshed after peer reboot");
        Ok(())
    }

    fn finish_update(
        &mut self,
        handle: NeighborHandle,
        ids: NeighborIds,
        form: &UpdateFrame,
        frame_counter: u32,
    ) {
        let now = self.clock.now();
        let lifetime = self.config.neighbor_lifetime;
        if let Some(n) = self.neighbors.get_mut(handle) {
            n.ids = ids;
            n.anti_replay.init(frame_counter);
            n.status = NeighborStatus::Permanent;
            n.foreign_index = form.receiver_index;
            n.broadcast_key = form.broadcast_key.clone();
            n.expiration_time = now + lifetime;
            info!(
                peer = %ids.extended_addr,
                short = %ids.short_addr,
                local_index = n.local_index,
                foreign_index = n.foreign_index,
                "neighbor permanent"
            );
        }
        self.backup_to_flash();
        self.trickle_on_new_neighbor();
    }

    // ------------------------------------------------------------------
    // Frame building and sealing
    // ------------------------------------------------------------------

    fn next_frame_counter(&mut self) -> u32 {
        self.frame_counter = self.frame_counter.wrapping_add(1);
        self.frame_counter
    }

    fn send_update_command(
        &mut self,
        id: CommandId,
        handle: NeighborHandle,
        extra: Option<Challenge>,
        key: &Key128,
    ) {
        let Some(n) = self.neighbors.get(handle) else {
            return;
        };
        let dst = n.ids.extended_addr;
        let receiver_index = n.local_index;

        let with_bk = self.config.with_broadcast_keys;
        let frame = UpdateFrame {
            extra,
            short_addr: self.own_ids.short_addr,
            receiver_index,
            broadcast_key: with_bk.then(|| self.broadcast_key.clone()),
        };
        let mut payload = frame.encode(id);
        let level = if with_bk {
            SecurityLevel::MIC_ENCRYPTED
        } else {
            SecurityLevel::MIC
        };
        let clear = UpdateFrame::clear_prefix_len(payload.len(), with_bk);
        let counter = self.next_frame_counter();
        let nonce = FrameNonce::new(self.own_ids.extended_addr.as_bytes(), counter, level);
        match seal(key, &nonce, clear, &mut payload) {
            Ok(mic) => {
                self.mac.send(WireFrame {
                    src: self.own_ids.extended_addr,
                    dst: Dst::Unicast(dst),
                    level,
                    frame_counter: counter,
                    payload,
                    mic: Some(mic),
                    broadcast_mics: Vec::new(),
                });
                debug!(?id, peer = %dst, "command frame sent");
            }
            Err(err) => warn!(%err, ?id, "failed to seal command frame"),
        }
    }

    fn open_unicast(&self, key: &Key128, frame: &mut WireFrame) -> Result<(), Discard> {
        if !frame.level.is_secured() {
            return Err(Discard::CryptoReject);
        }
        let Some(mic) = frame.mic else {
            return Err(Discard::CryptoReject);
        };
        let clear = if frame.level.has_encryption() {
            if frame.payload.len() < KEY_LEN {
                return Err(Discard::CryptoReject);
            }
            frame.payload.len() - KEY_LEN
        } else {
            frame.payload.len()
        };
        let nonce = FrameNonce::new(frame.src.as_bytes(), frame.frame_counter, frame.level);
        open(key, &nonce, clear, &mut frame.payload, &mic).map_err(|_| Discard::CryptoReject)
    }

    // ------------------------------------------------------------------
    // Trickle scheduler
    // ------------------------------------------------------------------

    fn broadcast_hello(&mut self) {
        self.our_challenge = self.prng.challenge();
        let hello = HelloFrame {
            challenge: self.our_challenge,
            short_addr: self.own_ids.short_addr,
        };
        let counter = self.next_frame_counter();
        self.mac.send(WireFrame {
            src: self.own_ids.extended_addr,
            dst: Dst::Broadcast,
            level: SecurityLevel::NONE,
            frame_counter: counter,
            payload: hello.encode(),
            mic: None,
            broadcast_mics: Vec::new(),
        });
        debug!("HELLO broadcast");
    }

    fn trickle_fire(&mut self) {
        self.broadcast_hello();
        let now = self.clock.now();
        let interval = self.trickle.interval(self.config.trickle_min_interval);
        let hello_duration = self.config.hello_duration();

        let rest = interval
            .saturating_sub(self.last_hello_delay)
            .max(hello_duration);
        if let Some(key) = self.trickle_timer.take() {
            self.timers.cancel(key);
        }
        self.trickle_timer = Some(self.timers.schedule(now + rest, TimerEvent::TrickleIntervalEnd));
        if let Some(key) = self.hello_timer.take() {
            self.timers.cancel(key);
        }
        self.hello_timer = Some(
            self.timers
                .schedule(now + hello_duration, TimerEvent::HelloWindowEnd),
        );
    }

    fn on_hello_window_end(&mut self) {
        self.hello_timer = None;
        self.try_finish_bootstrap();
        if self.trickle.new_neighbors() >= self.config.reset_threshold {
            self.trickle_reset();
        }
    }

    fn on_trickle_interval_end(&mut self) {
        self.trickle_timer = None;
        self.trickle.double(self.config.trickle_max_doublings);
        self.trickle.clear_new_neighbors();

        let half = self.trickle.interval(self.config.trickle_min_interval) / 2;
        let delay = half + self.prng.uniform_duration(half);
        self.last_hello_delay = delay;
        let now = self.clock.now();
        self.trickle_timer = Some(self.timers.schedule(now + delay, TimerEvent::TrickleBroadcast));
        debug!(
            ?delay,
            doublings = self.trickle.doublings(),
            "next HELLO scheduled"
        );
    }

    fn trickle_on_new_neighbor(&mut self) {
        let count = self.trickle.record_new_neighbor();
        if count == self.config.reset_threshold && self.hello_timer.is_none() {
            self.trickle_reset();
        } else {
            self.try_finish_bootstrap();
        }
    }

    fn trickle_stop(&mut self) {
        if let Some(key) = self.trickle_timer.take() {
            self.timers.cancel(key);
        }
        if let Some(key) = self.hello_timer.take() {
            self.timers.cancel(key);
        }
        self.try_finish_bootstrap();
    }

    fn trickle_reset(&mut self) {
        debug!("trickle reset");
        self.trickle_stop();
        self.trickle.reset();
        self.on_trickle_interval_end();
    }

    fn try_finish_bootstrap(&mut self) {
        if self.hello_timer.is_some() || self.trickle.new_neighbors() == 0 {
            return;
        }
        self.finish_bootstrap_now();
    }

    fn finish_bootstrap_now(&mut self) {
        if let Some(cb) = self.on_bootstrapped.take() {
            info!("bootstrap complete");
            cb();
        }
    }

    // ------------------------------------------------------------------
    // Keepalive loop
    // ------------------------------------------------------------------

    fn on_update_check(&mut self) {
        self.update_pass = Some(UpdatePass::new(
            self.neighbors.handles(),
            self.config.max_updates,
        ));
        self.run_update_pass();
    }

    fn run_update_pass(&mut self) {
        loop {
            let Some(pass) = self.update_pass.as_ref() else {
                return;
            };
            let Some(handle) = pass.current() else {
                break;
            };
            let may_retry = pass.may_retry();

            let decision = {
                let count = self.neighbors.count();
                let now = self.clock.now();
                match self.neighbors.get(handle) {
                    Some(n) if n.status == NeighborStatus::Permanent => {
                        update_decision(&self.config, count, now, n.expiration_time)
                    }
                    // Stale handle or still mid-handshake.
                    _ => UpdateDecision::Skip,
                }
            };

            match decision {
                UpdateDecision::Prolong => {
                    let now = self.clock.now();
                    let lifetime = self.config.neighbor_lifetime;
                    if let Some(n) = self.neighbors.get_mut(handle) {
                        n.expiration_time = now + lifetime;
                    }
                    self.advance_pass();
                }
                UpdateDecision::Skip => self.advance_pass(),
                UpdateDecision::Probe if !may_retry => self.advance_pass(),
                UpdateDecision::Probe => {
                    let Some(key) = self.neighbors.get(handle).map(|n| n.pairwise_key.clone())
                    else {
                        self.advance_pass();
                        continue;
                    };
                    self.send_update_command(CommandId::Update, handle, None, &key);
                    if let Some(pass) = self.update_pass.as_mut() {
                        pass.consume_retry();
                    }
                    let now = self.clock.now();
                    self.timers
                        .schedule(now + self.config.updateack_wait, TimerEvent::UpdateRetry);
                    return;
                }
            }
        }

        self.update_pass = None;
        let now = self.clock.now();
        self.neighbors.purge_expired(now);
        self.timers.schedule(
            now + self.config.update_check_interval,
            TimerEvent::UpdateCheck,
        );
    }

    fn advance_pass(&mut self) {
        if let Some(pass) = self.update_pass.as_mut() {
            pass.advance(self.config.max_updates);
        }
    }

    // ------------------------------------------------------------------
    // Reboot rekeying
    // ------------------------------------------------------------------

    fn restore_from_flash(&mut self) -> usize {
        let records = match restore_neighbors(self.flash.as_ref()) {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "neighbor restore failed; starting empty");
                return 0;
            }
        };

        let now = self.clock.now();
        let lifetime = self.config.neighbor_lifetime;
        let mut restored = 0;
        for record in records {
            if NeighborStatus::from_raw(record.status) != Some(NeighborStatus::Permanent) {
                continue;
            }
            let old_key = Key128::new(record.pairwise_key);
            let neighbor = Neighbor {
                ids: NeighborIds::new(
                    ExtendedAddr::new(record.extended_addr),
                    ShortAddr::new(record.short_addr),
                ),
                local_index: record.local_index,
                foreign_index: record.foreign_index,
                pairwise_key: rekey_after_reboot(&old_key),
                broadcast_key: record.broadcast_key.map(Key128::new),
                metadata: [0u8; KEY_LEN],
                anti_replay: AntiReplay::new(),
                status: NeighborStatus::Permanent,
                expiration_time: now + lifetime,
            };
            if self.neighbors.restore(neighbor).is_some() {
                restored += 1;
            } else {
                warn!("dropping unrestorable neighbor record");
            }
        }
        restored
    }

    fn on_refresh_broadcast(&mut self) {
        if self.refresh_remaining == 0 {
            return;
        }
        self.send_refresh();
        self.refresh_remaining -= 1;
        if self.refresh_remaining > 0 {
            let now = self.clock.now();
            self.timers
                .schedule(now + self.config.refresh_spacing, TimerEvent::RefreshBroadcast);
        } else {
            self.backup_to_flash();
            self.finish_bootstrap_now();
        }
    }

    fn send_refresh(&mut self) {
        let counter = self.next_frame_counter();
        let level = SecurityLevel::MIC;
        let nonce = FrameNonce::new(self.own_ids.extended_addr.as_bytes(), counter, level);
        let payload = vec![CommandId::Refresh as u8];

        let mut mics: Vec<Mic> = Vec::new();
        for n in self.neighbors.iter() {
            if n.status != NeighborStatus::Permanent {
                continue;
            }
            let mut sealed = payload.clone();
            let clear_len = sealed.len();
            let Ok(mic) = seal(&n.pairwise_key, &nonce, clear_len, &mut sealed) else {
                continue;
            };
            let index = n.local_index as usize;
            if mics.len() <= index {
                mics.resize(index + 1, Mic([0u8; MIC_LEN]));
            }
            mics[index] = mic;
        }

        self.mac.send(WireFrame {
            src: self.own_ids.extended_addr,
            dst: Dst::Broadcast,
            level,
            frame_counter: counter,
            payload,
            mic: None,
            broadcast_mics: mics,
        });
        debug!("REFRESH broadcast");
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn backup_to_flash(&mut self) {
        let records: Vec<NeighborRecord> = self.neighbors.iter().map(record_from).collect();
        if let Err(err) = backup_neighbors(self.flash.as_mut(), &records) {
            warn!(%err, "neighbor backup failed; RAM state stays authoritative");
        }
    }

    fn dispatch(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::HelloAckWait(handle) => self.on_wait_expired(handle),
            TimerEvent::TrickleBroadcast => self.trickle_fire(),
            TimerEvent::TrickleIntervalEnd => self.on_trickle_interval_end(),
            TimerEvent::HelloWindowEnd => self.on_hello_window_end(),
            TimerEvent::UpdateCheck => self.on_update_check(),
            TimerEvent::UpdateRetry => self.run_update_pass(),
            TimerEvent::RefreshBroadcast => self.on_refresh_broadcast(),
        }
    }
}

impl LinkSecurity for Apkes {
    fn is_bootstrapped(&self) -> bool {
        Apkes::is_bootstrapped(self)
    }

    fn bootstrap(&mut self, on_bootstrapped: BootstrapCallback) {
        Apkes::bootstrap(self, on_bootstrapped);
    }

    fn on_frame(&mut self, frame: WireFrame) {
        Apkes::on_frame(self, frame);
    }
}

fn record_from(n: &Neighbor) -> NeighborRecord {
    NeighborRecord {
        extended_addr: *n.ids.extended_addr.as_bytes(),
        short_addr: n.ids.short_addr.as_u16(),
        local_index: n.local_index,
        foreign_index: n.foreign_index,
        status: n.status as u8,
        pairwise_key: *n.pairwise_key.as_bytes(),
        broadcast_key: n.broadcast_key.as_ref().map(|k| *k.as_bytes()),
        expiration_secs: n.expiration_time.as_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::FixedSecretScheme;
    use apkes_store::MemFlash;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    const OWN_ADDR: [u8; 8] = [0x01; 8];
    const SECRET: [u8; 16] = [0xAA; 16];

    struct TestClock(Rc<Cell<Duration>>);

    impl Clock for TestClock {
        fn now(&self) -> Duration {
            self.0.get()
        }
    }

    struct VecMac(Rc<RefCell<Vec<WireFrame>>>);

    impl Mac for VecMac {
        fn send(&mut self, frame: WireFrame) {
            self.0.borrow_mut().push(frame);
        }
    }

    struct TestNode {
        apkes: Apkes,
        sent: Rc<RefCell<Vec<WireFrame>>>,
        clock: Rc<Cell<Duration>>,
    }

    impl TestNode {
        fn advance(&mut self, by: Duration) {
            self.clock.set(self.clock.get() + by);
            self.apkes.poll_timers();
        }

        fn drain(&self) -> Vec<WireFrame> {
            self.sent.borrow_mut().drain(..).collect()
        }

        fn neighbor(&self, addr: [u8; 8]) -> Option<&Neighbor> {
            let handle = self.apkes.neighbors().lookup(&ExtendedAddr::new(addr))?;
            self.apkes.neighbors().get(handle)
        }
    }

    fn test_config() -> Config {
        Config {
            max_waiting_period: Duration::from_secs(3),
            ack_delay: Duration::from_secs(1),
            reset_threshold: 10,
            ..Config::default()
        }
    }

    fn make_node(config: Config, seed: u8) -> TestNode {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let clock = Rc::new(Cell::new(Duration::ZERO));
        let platform = Platform {
            mac: Box::new(VecMac(sent.clone())),
            scheme: Box::new(FixedSecretScheme::new(Key128::new(SECRET))),
            flash: Box::new(MemFlash::new()),
            clock: Box::new(TestClock(clock.clone())),
            prng: Prng::from_seed([seed; 16], 0),
        };
        let apkes = Apkes::new(
            config,
            NeighborIds::new(ExtendedAddr::new(OWN_ADDR), ShortAddr::new(0x0001)),
            platform,
        );
        TestNode { apkes, sent, clock }
    }

    fn hello_from(peer: u8, challenge: Challenge) -> WireFrame {
        WireFrame {
            src: ExtendedAddr::new([peer; 8]),
            dst: Dst::Broadcast,
            level: SecurityLevel::NONE,
            frame_counter: 1,
            payload: HelloFrame {
                challenge,
                short_addr: ShortAddr::new(u16::from(peer)),
            }
            .encode(),
            mic: None,
            broadcast_mics: Vec::new(),
        }
    }

    fn craft_sealed(
        id: CommandId,
        peer: u8,
        key: &Key128,
        counter: u32,
        form: &UpdateFrame,
    ) -> WireFrame {
        let src = [peer; 8];
        let mut payload = form.encode(id);
        let clear = UpdateFrame::clear_prefix_len(payload.len(), form.broadcast_key.is_some());
        let level = SecurityLevel::MIC_ENCRYPTED;
        let nonce = FrameNonce::new(&src, counter, level);
        let mic = seal(key, &nonce, clear, &mut payload).expect("seal");
        WireFrame {
            src: ExtendedAddr::new(src),
            dst: Dst::Unicast(ExtendedAddr::new(OWN_ADDR)),
            level,
            frame_counter: counter,
            payload,
            mic: Some(mic),
            broadcast_mics: Vec::new(),
        }
    }

    /// Drive the node through a responder-side handshake with a crafted
    /// peer; returns the negotiated key.
    fn respond_handshake(node: &mut TestNode, peer: u8, initiator_challenge: Challenge) -> Key128 {
        node.apkes.on_frame(hello_from(peer, initiator_challenge));
        node.advance(Duration::from_secs(3));

        let peer_addr = ExtendedAddr::new([peer; 8]);
        let helloack = node
            .drain()
            .into_iter()
            .rev()
            .find(|f| {
                f.payload.first() == Some(&(CommandId::HelloAck as u8))
                    && f.dst == Dst::Unicast(peer_addr)
            })
            .expect("HELLOACK emitted");

        let mut responder_challenge = [0u8; CHALLENGE_LEN];
        responder_challenge.copy_from_slice(&helloack.payload[1..1 + CHALLENGE_LEN]);
        let key = derive_pairwise_key(
            &Key128::new(SECRET),
            &initiator_challenge,
            &responder_challenge,
        );

        let ack_form = UpdateFrame {
            extra: None,
            short_addr: ShortAddr::new(u16::from(peer)),
            receiver_index: 0,
            broadcast_key: Some(Key128::new([peer; 16])),
        };
        node.apkes
            .on_frame(craft_sealed(CommandId::Ack, peer, &key, 2, &ack_form));
        key
    }

    #[test]
    fn test_hello_creates_tentative_neighbor() {
        let mut node = make_node(test_config(), 1);
        node.apkes.bootstrap(Box::new(|| {}));
        node.drain();

        node.apkes.on_frame(hello_from(9, [0x11; 8]));

        let n = node.neighbor([9; 8]).expect("tentative entry");
        assert_eq!(n.status, NeighborStatus::Tentative);
        assert_eq!(n.ids.short_addr, ShortAddr::new(9));
        assert_eq!(&n.metadata[..8], &[0x11; 8]);
        assert_eq!(
            n.expiration_time,
            node.clock.get() + node.apkes.config().hello_duration()
        );
    }

    #[test]
    fn test_hello_flood_bounded_by_wait_pool() {
        let config = Config {
            max_tentative: 2,
            ..test_config()
        };
        let mut node = make_node(config, 2);
        node.apkes.bootstrap(Box::new(|| {}));

        node.apkes.on_frame(hello_from(10, [0xA0; 8]));
        node.apkes.on_frame(hello_from(11, [0xA1; 8]));
        node.apkes.on_frame(hello_from(12, [0xA2; 8]));

        assert_eq!(node.apkes.neighbors().count(), 2);
        assert!(node.neighbor([10; 8]).is_some());
        assert!(node.neighbor([11; 8]).is_some());
        assert!(node.neighbor([12; 8]).is_none());
        // The two accepted entries are untouched by the overflow.
        assert_eq!(
            node.neighbor([10; 8]).unwrap().status,
            NeighborStatus::Tentative
        );
        assert_eq!(
            node.neighbor([11; 8]).unwrap().status,
            NeighborStatus::Tentative
        );
    }

    #[test]
    fn test_second_hello_from_known_peer_ignored() {
        let mut node = make_node(test_config(), 3);
        node.apkes.bootstrap(Box::new(|| {}));

        node.apkes.on_frame(hello_from(9, [0x11; 8]));
        node.apkes.on_frame(hello_from(9, [0x22; 8]));

        assert_eq!(node.apkes.neighbors().count(), 1);
        // The original challenge is retained.
        assert_eq!(&node.neighbor([9; 8]).unwrap().metadata[..8], &[0x11; 8]);
    }

    #[test]
    fn test_wait_timer_emits_verifiable_helloack() {
        let mut node = make_node(test_config(), 4);
        node.apkes.bootstrap(Box::new(|| {}));
        node.drain();

        let ca = [0x11; 8];
        node.apkes.on_frame(hello_from(9, ca));
        node.advance(Duration::from_secs(3));

        let mut helloack = node
            .drain()
            .into_iter()
            .find(|f| f.payload.first() == Some(&(CommandId::HelloAck as u8)))
            .expect("HELLOACK emitted");

        assert_eq!(helloack.dst, Dst::Unicast(ExtendedAddr::new([9; 8])));
        assert!(helloack.level.has_encryption());

        // The receiver reconstructs the key from the cleartext prefix.
        let mut cb = [0u8; 8];
        cb.copy_from_slice(&helloack.payload[1..9]);
        let key = derive_pairwise_key(&Key128::new(SECRET), &ca, &cb);

        let clear = helloack.payload.len() - KEY_LEN;
        let nonce = FrameNonce::new(&OWN_ADDR, helloack.frame_counter, helloack.level);
        open(
            &key,
            &nonce,
            clear,
            &mut helloack.payload,
            &helloack.mic.unwrap(),
        )
        .expect("MIC verifies under derived key");

        let form = UpdateFrame::parse(CommandId::HelloAck, &helloack.payload, true).unwrap();
        assert_eq!(form.short_addr, ShortAddr::new(0x0001));
        assert_eq!(form.receiver_index, 0);
        assert_eq!(
            node.neighbor([9; 8]).unwrap().status,
            NeighborStatus::TentativeAwaitingAck
        );
        assert_eq!(node.neighbor([9; 8]).unwrap().pairwise_key, key);
    }

    #[test]
    fn test_initiator_accepts_helloack_and_acks() {
        let mut node = make_node(test_config(), 5);
        node.apkes.bootstrap(Box::new(|| {}));

        let hello = node
            .drain()
            .into_iter()
            .find(|f| f.payload.first() == Some(&(CommandId::Hello as u8)))
            .expect("bootstrap HELLO");
        let mut ca = [0u8; 8];
        ca.copy_from_slice(&hello.payload[1..9]);

        let cb = [0x22; 8];
        let key = derive_pairwise_key(&Key128::new(SECRET), &ca, &cb);
        let form = UpdateFrame {
            extra: Some(cb),
            short_addr: ShortAddr::new(0x0002),
            receiver_index: 0,
            broadcast_key: Some(Key128::new([0xBB; 16])),
        };
        node.apkes
            .on_frame(craft_sealed(CommandId::HelloAck, 9, &key, 1, &form));

        let n = node.neighbor([9; 8]).expect("neighbor created");
        assert_eq!(n.status, NeighborStatus::Permanent);
        assert_eq!(n.pairwise_key, key);
        assert_eq!(n.local_index, 0);
        assert_eq!(n.foreign_index, 0);
        assert_eq!(n.ids.short_addr, ShortAddr::new(0x0002));
        assert_eq!(
            n.broadcast_key.as_ref().unwrap().as_bytes(),
            &[0xBB; 16]
        );

        // The confirmation ACK verifies under the same key.
        let mut ack = node
            .drain()
            .into_iter()
            .find(|f| f.payload.first() == Some(&(CommandId::Ack as u8)))
            .expect("ACK emitted");
        let clear = ack.payload.len() - KEY_LEN;
        let nonce = FrameNonce::new(&OWN_ADDR, ack.frame_counter, ack.level);
        open(&key, &nonce, clear, &mut ack.payload, &ack.mic.unwrap()).expect("ACK verifies");
    }

    #[test]
    fn test_tampered_helloack_leaves_no_neighbor() {
        let mut node = make_node(test_config(), 6);
        node.apkes.bootstrap(Box::new(|| {}));
        node.drain();

        let cb = [0x22; 8];
        let wrong_key = derive_pairwise_key(&Key128::new([0x13; 16]), &[0; 8], &cb);
        let form = UpdateFrame {
            extra: Some(cb),
            short_addr: ShortAddr::new(0x0002),
            receiver_index: 0,
            broadcast_key: Some(Key128::new([0xBB; 16])),
        };
        node.apkes
            .on_frame(craft_sealed(CommandId::HelloAck, 9, &wrong_key, 1, &form));

        assert!(node.neighbor([9; 8]).is_none());
        assert!(node.drain().is_empty());
    }

    #[test]
    fn test_responder_handshake_completes() {
        let mut node = make_node(test_config(), 7);
        node.apkes.bootstrap(Box::new(|| {}));
        let key = respond_handshake(&mut node, 9, [0x11; 8]);

        let n = node.neighbor([9; 8]).unwrap();
        assert_eq!(n.status, NeighborStatus::Permanent);
        assert_eq!(n.pairwise_key, key);
        assert_eq!(n.foreign_index, 0);
    }

    #[test]
    fn test_replayed_update_dropped() {
        let mut node = make_node(test_config(), 8);
        node.apkes.bootstrap(Box::new(|| {}));
        let key = respond_handshake(&mut node, 9, [0x11; 8]);
        node.drain();

        let form = UpdateFrame {
            extra: None,
            short_addr: ShortAddr::new(9),
            receiver_index: 0,
            broadcast_key: Some(Key128::new([9; 16])),
        };
        let update = craft_sealed(CommandId::Update, 9, &key, 7, &form);

        node.apkes.on_frame(update.clone());
        let prolonged_until = node.neighbor([9; 8]).unwrap().expiration_time;
        let updateacks = node
            .drain()
            .into_iter()
            .filter(|f| f.payload.first() == Some(&(CommandId::UpdateAck as u8)))
            .count();
        assert_eq!(updateacks, 1);

        // The identical frame again, a second later: no UPDATEACK and no
        // change to the lease.
        node.advance(Duration::from_secs(1));
        node.apkes.on_frame(update);
        assert_eq!(node.neighbor([9; 8]).unwrap().expiration_time, prolonged_until);
        let updateacks = node
            .drain()
            .into_iter()
            .filter(|f| f.payload.first() == Some(&(CommandId::UpdateAck as u8)))
            .count();
        assert_eq!(updateacks, 0);
    }

    #[test]
    fn test_trickle_reset_on_neighbor_density() {
        let config = Config {
            trickle_min_interval: Duration::from_secs(30),
            trickle_max_doublings: 2,
            reset_threshold: 2,
            ..test_config()
        };
        let mut node = make_node(config, 9);
        node.apkes.bootstrap(Box::new(|| {}));

        // Run quietly until the interval has doubled at least once.
        let mut guard = 0;
        while node.apkes.trickle_state().doublings() < 1 {
            node.advance(Duration::from_secs(1));
            guard += 1;
            assert!(guard < 400, "interval never doubled");
        }
        let i_min = node.apkes.config().trickle_min_interval;
        assert!(node.apkes.trickle_state().interval(i_min) > i_min);

        // Two new neighbors within one interval collapse the schedule.
        // Both ACKs land back to back so both count into the same
        // interval.
        node.apkes.on_frame(hello_from(20, [0xC0; 8]));
        node.apkes.on_frame(hello_from(21, [0xC1; 8]));
        node.advance(Duration::from_secs(3));
        let sent = node.drain();
        for (peer, ca) in [(20u8, [0xC0u8; 8]), (21u8, [0xC1u8; 8])] {
            let helloack = sent
                .iter()
                .find(|f| {
                    f.payload.first() == Some(&(CommandId::HelloAck as u8))
                        && f.dst == Dst::Unicast(ExtendedAddr::new([peer; 8]))
                })
                .expect("HELLOACK emitted");
            let mut cb = [0u8; 8];
            cb.copy_from_slice(&helloack.payload[1..9]);
            let key = derive_pairwise_key(&Key128::new(SECRET), &ca, &cb);
            let form = UpdateFrame {
                extra: None,
                short_addr: ShortAddr::new(u16::from(peer)),
                receiver_index: 0,
                broadcast_key: Some(Key128::new([peer; 16])),
            };
            node.apkes
                .on_frame(craft_sealed(CommandId::Ack, peer, &key, 2, &form));
        }
        node.advance(Duration::from_secs(5));

        assert!(node.apkes.trickle_state().doublings() <= 0);
        assert_eq!(node.apkes.trickle_state().interval(i_min), i_min);
        // The next HELLO sits within one minimum interval of now.
        let next = node.apkes.next_deadline().expect("HELLO scheduled");
        assert!(next <= node.clock.get() + i_min);
    }

    #[test]
    fn test_lazy_pass_prolongs_without_updates() {
        let config = Config {
            max_neighbors: 8,
            max_tentative: 2,
            ..test_config()
        };
        let mut node = make_node(config, 10);
        node.apkes.bootstrap(Box::new(|| {}));

        for peer in 30..35u8 {
            respond_handshake(&mut node, peer, [peer; 8]);
        }
        assert_eq!(node.apkes.neighbors().count(), 5);
        node.drain();

        // First keepalive pass: 5 entries against a lazy threshold of 6.
        let pass_at = Duration::from_secs(180);
        node.clock.set(pass_at);
        node.apkes.poll_timers();

        let updates = node
            .drain()
            .into_iter()
            .filter(|f| f.payload.first() == Some(&(CommandId::Update as u8)))
            .count();
        assert_eq!(updates, 0, "lazy pass must not probe");
        for n in node.apkes.neighbors().iter() {
            assert_eq!(
                n.expiration_time,
                pass_at + Duration::from_secs(3600),
                "every entry prolonged for free"
            );
        }
    }

    #[test]
    fn test_bootstrap_fires_once_after_window_with_neighbor() {
        let fired = Rc::new(Cell::new(0u32));
        let observed = fired.clone();

        let mut node = make_node(test_config(), 11);
        assert!(node.apkes.is_bootstrapped());
        node.apkes
            .bootstrap(Box::new(move || observed.set(observed.get() + 1)));
        assert!(!node.apkes.is_bootstrapped());

        respond_handshake(&mut node, 9, [0x11; 8]);
        // Window still open right after the handshake at t=3.
        assert_eq!(fired.get(), 0);

        node.advance(Duration::from_secs(2));
        assert_eq!(fired.get(), 1);
        assert!(node.apkes.is_bootstrapped());

        // Further neighbors never re-fire the callback.
        respond_handshake(&mut node, 12, [0x12; 8]);
        node.advance(Duration::from_secs(10));
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_stop_releases_pending_bootstrap() {
        let fired = Rc::new(Cell::new(0u32));
        let observed = fired.clone();

        let mut node = make_node(test_config(), 12);
        node.apkes
            .bootstrap(Box::new(move || observed.set(observed.get() + 1)));
        respond_handshake(&mut node, 9, [0x11; 8]);

        // Window open, callback pending; stop must evaluate completion.
        node.apkes.stop();
        assert_eq!(fired.get(), 1);
    }
}
