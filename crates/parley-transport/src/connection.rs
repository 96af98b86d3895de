//! The connection engine.
//!
//! [`ConnectionCore`] is a single-owner state machine: every entry point
//! takes the current [`Instant`], no clock or socket is read inside, and
//! datagrams to transmit accumulate in an internal queue the caller
//! drains with [`take_outgoing`](ConnectionCore::take_outgoing). That
//! keeps every protocol rule testable under a simulated clock.
//!
//! [`Connection`] is the async shell around it: one receive task and one
//! 100 ms tick task feed the core behind a mutex, outgoing datagrams are
//! flushed to a connected UDP socket after every core call, and events
//! reach the application over an unbounded channel so a slow consumer
//! never stalls the socket.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parley_core::packet::{ack_payload, parse_ack_payload};
use parley_core::{
    quickerlz, Direction, GenerationWindow, Packet, PacketFlags, PacketType, RingQueue, SetState,
    VoiceFrame,
};
use parley_crypto::identity::parse_public_key;
use parley_crypto::license::{LicenseChain, ROOT_KEY};
use parley_crypto::{CryptoSession, Identity, KeyScheme};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::command::Command;
use crate::error::{ConnectionError, HandshakeError, Reason};
use crate::handshake::{Init1Machine, Init1Reply};
use crate::rto::{ResendQueue, CLOCK_GRANULARITY};
use crate::stats::NetworkStats;
use crate::udp::UdpConnection;

/// Largest payload a single packet carries; larger messages are split
pub const MAX_OUT_CONTENT_SIZE: usize = 480;

/// An unacked packet (or total silence) older than this kills the
/// connection with `Reason::Timeout`
pub const PACKET_TIMEOUT: Duration = Duration::from_secs(20);

/// Keepalive cadence once connected
pub const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence of the timer entry point
pub const TICK_INTERVAL: Duration = CLOCK_GRANULARITY;

/// Init1 packets all reuse this id; the step byte orders them instead
const INIT1_PACKET_ID: u16 = 0x65;

/// Reorder window for every incoming kind
const RECV_WINDOW: u32 = 128;

/// Hard cap on buffered out-of-order command packets
const MAX_QUEUE_LEN: usize = 512;

/// Decompression bomb guard for incoming commands
const MAX_DECOMPRESSED_SIZE: usize = 1 << 20;

/// Acks up to this id may still arrive under the dummy key
const DUMMY_ACK_MAX_ID: u16 = 2;

/// What a connection reports to its application.
#[derive(Debug)]
pub enum Event {
    /// Key negotiation finished; commands are now encrypted end to end
    Connected,
    /// A complete, defragmented, decompressed command payload
    Command(Vec<u8>),
    /// An in-window voice frame
    Voice(VoiceFrame),
    /// The connection ended; emitted exactly once
    Disconnected(Reason),
}

/// Coarse connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session, nothing in flight
    Disconnected,
    /// Init1 or key negotiation in progress
    Connecting,
    /// Session keys installed
    Connected,
    /// Farewell command queued, teardown imminent
    Disconnecting,
}

/// Static parameters for one connection.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// The client identity used for key negotiation
    pub identity: Identity,
    /// Version constant announced in Init1 step 0
    pub version: u32,
    /// Root key the server's license chain must verify against
    pub license_root: [u8; 32],
}

impl ConnectionConfig {
    /// Default parameters for an identity.
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            version: 0x0602_0000,
            license_root: ROOT_KEY,
        }
    }

    /// Override the announced version constant.
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Override the license root (test servers sign with their own).
    #[must_use]
    pub fn with_license_root(mut self, root: [u8; 32]) -> Self {
        self.license_root = root;
        self
    }
}

/// Outgoing sequence state for one packet kind.
#[derive(Debug, Clone, Copy, Default)]
struct IdCounter {
    id: u16,
    generation: u32,
}

impl IdCounter {
    fn next(&mut self) -> (u16, u32) {
        let current = (self.id, self.generation);
        let (id, wrapped) = self.id.overflowing_add(1);
        self.id = id;
        if wrapped {
            self.generation += 1;
        }
        current
    }
}

/// The synchronous connection state machine.
pub struct ConnectionCore {
    config: ConnectionConfig,
    state: ConnectionState,
    crypto: CryptoSession,
    handshake: Option<Init1Machine>,
    init_timestamp: u32,
    alpha: [u8; 10],
    client_id: u16,
    out: [IdCounter; PacketType::COUNT],
    in_windows: [GenerationWindow; PacketType::COUNT],
    commands: RingQueue,
    commands_low: RingQueue,
    resend: ResendQueue,
    stats: NetworkStats,
    outstanding_ping: Option<(u16, Instant)>,
    last_ping_sent: Option<Instant>,
    last_traffic: Instant,
    send_queue: Vec<Vec<u8>>,
    events: mpsc::UnboundedSender<Event>,
    ticking: bool,
}

impl ConnectionCore {
    /// Create an idle core that will report events on `events`.
    #[must_use]
    pub fn new(config: ConnectionConfig, events: mpsc::UnboundedSender<Event>, now: Instant) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            crypto: CryptoSession::new(),
            handshake: None,
            init_timestamp: 0,
            alpha: [0; 10],
            client_id: 0,
            out: [IdCounter::default(); PacketType::COUNT],
            in_windows: std::array::from_fn(|_| GenerationWindow::new(RECV_WINDOW)),
            commands: RingQueue::new(RECV_WINDOW, MAX_QUEUE_LEN, MAX_DECOMPRESSED_SIZE),
            commands_low: RingQueue::new(RECV_WINDOW, MAX_QUEUE_LEN, MAX_DECOMPRESSED_SIZE),
            resend: ResendQueue::new(),
            stats: NetworkStats::default(),
            outstanding_ping: None,
            last_ping_sent: None,
            last_traffic: now,
            send_queue: Vec::new(),
            events,
            ticking: false,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Traffic counters.
    #[must_use]
    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// The id the server assigned us (0 until the application learns it
    /// from the welcome command and calls
    /// [`set_client_id`](Self::set_client_id)).
    #[must_use]
    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    /// Install the server-assigned client id into outgoing headers.
    pub fn set_client_id(&mut self, client_id: u16) {
        self.client_id = client_id;
    }

    /// Drain the datagrams queued since the last call.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.send_queue)
    }

    /// Begin the handshake: queue Init1 step 0.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Closed` unless the core is disconnected.
    pub fn connect(&mut self, now: Instant, timestamp: u32) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Disconnected {
            return Err(ConnectionError::Closed);
        }
        self.state = ConnectionState::Connecting;
        self.last_traffic = now;
        self.init_timestamp = timestamp;
        self.alpha = rand::random();

        // A reused core starts the new session from a clean slate: fresh
        // counters, windows and queues, as if freshly constructed.
        self.client_id = 0;
        self.out = [IdCounter::default(); PacketType::COUNT];
        self.in_windows = std::array::from_fn(|_| GenerationWindow::new(RECV_WINDOW));
        self.commands = RingQueue::new(RECV_WINDOW, MAX_QUEUE_LEN, MAX_DECOMPRESSED_SIZE);
        self.commands_low = RingQueue::new(RECV_WINDOW, MAX_QUEUE_LEN, MAX_DECOMPRESSED_SIZE);
        self.stats = NetworkStats::default();

        let machine = Init1Machine::new(self.config.version, rand::random());
        let step0 = machine.step0(timestamp);
        self.handshake = Some(machine);
        self.send_packet(PacketType::Init1, PacketFlags::new(), step0, now)?;
        Ok(())
    }

    /// Send a command, splitting and compressing as needed.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Closed` while disconnected.
    pub fn send_command(&mut self, payload: &[u8], now: Instant) -> Result<(), ConnectionError> {
        self.add_outgoing(
            PacketType::Command,
            PacketFlags::new().with_newprotocol(),
            payload.to_vec(),
            now,
        )
    }

    /// Send a low-priority command.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Closed` while disconnected.
    pub fn send_command_low(&mut self, payload: &[u8], now: Instant) -> Result<(), ConnectionError> {
        self.add_outgoing(
            PacketType::CommandLow,
            PacketFlags::new().with_newprotocol(),
            payload.to_vec(),
            now,
        )
    }

    /// Send a voice frame. Voice is never split or compressed; a frame
    /// that does not fit one datagram is an error.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::VoiceTooLarge` or
    /// `ConnectionError::Closed`.
    pub fn send_voice(&mut self, frame: &VoiceFrame, now: Instant) -> Result<(), ConnectionError> {
        let payload = frame.encode();
        if payload.len() > MAX_OUT_CONTENT_SIZE {
            return Err(ConnectionError::VoiceTooLarge(payload.len()));
        }
        let kind = if frame.whisper.is_some() {
            PacketType::VoiceWhisper
        } else {
            PacketType::Voice
        };
        self.add_outgoing(kind, PacketFlags::new().with_unencrypted(), payload, now)
    }

    /// User-initiated disconnect: say goodbye, then tear down.
    pub fn disconnect(&mut self, now: Instant) {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return;
        }
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnecting;
            let farewell = Command::new("clientdisconnect")
                .arg("reasonid", "8")
                .encode();
            if let Err(error) = self.add_outgoing(
                PacketType::Command,
                PacketFlags::new().with_newprotocol(),
                farewell,
                now,
            ) {
                debug!(%error, "farewell command not sent");
            }
        }
        self.teardown(Reason::LeftServer);
    }

    /// Tear down with an explicit reason (timeouts, kicks the application
    /// mapped from a notify, protocol errors). Idempotent.
    pub fn disconnect_with(&mut self, reason: Reason, _now: Instant) {
        self.teardown(reason);
    }

    /// Feed one raw datagram from the socket.
    ///
    /// Framing and crypto failures drop the datagram silently (logged at
    /// debug); protocol violations during the handshake tear the
    /// connection down.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        let (mut packet, mac) = match Packet::from_raw(data, Direction::ServerToClient) {
            Ok(parsed) => parsed,
            Err(error) => {
                trace!(%error, len = data.len(), "dropping unparseable datagram");
                return;
            }
        };

        packet.generation = match packet.packet_type {
            PacketType::Command => self.commands.window().generation_for(packet.packet_id),
            PacketType::CommandLow => self.commands_low.window().generation_for(packet.packet_id),
            kind => self.in_windows[kind as usize].generation_for(packet.packet_id),
        };

        if let Err(error) = self.crypto.decrypt_packet(&mut packet, &mac) {
            // A server may seal the Acks for the first handshake commands
            // under the dummy key even after the real keys took over. The
            // workaround is kept exactly that narrow: Ack, ids 0..=2.
            let retried = packet.packet_type == PacketType::Ack
                && packet.packet_id <= DUMMY_ACK_MAX_ID
                && self.crypto.decrypt_with_dummy(&mut packet, &mac).is_ok();
            if !retried {
                debug!(%error, kind = ?packet.packet_type, id = packet.packet_id, "dropping undecryptable packet");
                return;
            }
        }

        self.stats.record_received(data.len());
        self.last_traffic = now;
        self.dispatch(packet, now);
    }

    /// Run the periodic timer work: resends, backoff, liveness, pings.
    /// Guarded against re-entry; a nested call is a no-op.
    pub fn tick(&mut self, now: Instant) {
        if self.ticking {
            return;
        }
        self.ticking = true;
        self.tick_inner(now);
        self.ticking = false;
    }

    fn tick_inner(&mut self, now: Instant) {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }

        let silence = now.saturating_duration_since(self.last_traffic);
        let oldest = self.resend.oldest_age(now).unwrap_or(Duration::ZERO);
        if silence >= PACKET_TIMEOUT || oldest >= PACKET_TIMEOUT {
            warn!(?silence, ?oldest, "connection timed out");
            self.teardown(Reason::Timeout);
            return;
        }

        for wire in self.resend.due_resends(now) {
            self.stats.record_resend();
            self.stats.record_sent(wire.len());
            self.send_queue.push(wire);
        }

        if self.state == ConnectionState::Connected {
            let ping_due = self
                .last_ping_sent
                .map_or(true, |last| now.saturating_duration_since(last) >= PING_INTERVAL);
            if ping_due {
                match self.send_packet(
                    PacketType::Ping,
                    PacketFlags::new().with_unencrypted(),
                    Vec::new(),
                    now,
                ) {
                    Ok(id) => {
                        self.outstanding_ping = Some((id, now));
                        self.last_ping_sent = Some(now);
                    }
                    Err(error) => debug!(%error, "ping not sent"),
                }
            }
        }
    }

    /// Encrypt and queue a single packet, registering it for resend if
    /// its kind is ack-tracked. Returns the packet id used.
    fn send_packet(
        &mut self,
        kind: PacketType,
        flags: PacketFlags,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<u16, ConnectionError> {
        let (id, generation) = if kind == PacketType::Init1 {
            (INIT1_PACKET_ID, 0)
        } else {
            self.out[kind as usize].next()
        };

        let mut packet = Packet::new(
            kind,
            flags,
            id,
            Direction::ClientToServer {
                client_id: self.client_id,
            },
            payload,
        );
        packet.generation = generation;

        let mac = self.crypto.encrypt_packet(&mut packet)?;
        let wire = packet.to_wire(&mac);
        if kind.is_ack_tracked() {
            self.resend.register(kind, id, wire.clone(), now);
        }
        self.stats.record_sent(wire.len());
        self.send_queue.push(wire);
        Ok(id)
    }

    fn add_outgoing(
        &mut self,
        kind: PacketType,
        flags: PacketFlags,
        mut payload: Vec<u8>,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        if !matches!(
            self.state,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Disconnecting
        ) {
            return Err(ConnectionError::Closed);
        }

        let mut flags = flags;
        if payload.len() > MAX_OUT_CONTENT_SIZE {
            if kind.is_voice() {
                return Err(ConnectionError::VoiceTooLarge(payload.len()));
            }
            // Commands may shrink below the split threshold.
            let compressed = quickerlz::compress(&payload);
            if compressed.len() < payload.len() {
                payload = compressed;
                flags = flags.with_compressed();
            }
        }

        if payload.len() <= MAX_OUT_CONTENT_SIZE {
            self.send_packet(kind, flags, payload, now)?;
            return Ok(());
        }

        let last = (payload.len() - 1) / MAX_OUT_CONTENT_SIZE;
        for (index, chunk) in payload.chunks(MAX_OUT_CONTENT_SIZE).enumerate() {
            let mut fragment_flags = if index == 0 { flags } else { PacketFlags::new() };
            if index != last {
                fragment_flags = fragment_flags.with_fragmented();
            }
            self.send_packet(kind, fragment_flags, chunk.to_vec(), now)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, packet: Packet, now: Instant) {
        match packet.packet_type {
            PacketType::Voice | PacketType::VoiceWhisper => {
                let whisper = packet.packet_type == PacketType::VoiceWhisper;
                if !self.in_windows[packet.packet_type as usize].set_and_drag(packet.packet_id) {
                    trace!(id = packet.packet_id, "stale voice dropped");
                    return;
                }
                match VoiceFrame::parse(&packet.payload, whisper) {
                    Ok(frame) => {
                        let _ = self.events.send(Event::Voice(frame));
                    }
                    Err(error) => debug!(%error, "malformed voice payload"),
                }
            }
            PacketType::Command | PacketType::CommandLow => {
                self.handle_command_packet(packet, now);
            }
            PacketType::Ping => {
                self.in_windows[PacketType::Ping as usize].set_and_drag(packet.packet_id);
                if let Err(error) = self.send_packet(
                    PacketType::Pong,
                    PacketFlags::new().with_unencrypted(),
                    ack_payload(packet.packet_id),
                    now,
                ) {
                    debug!(%error, "pong not sent");
                }
            }
            PacketType::Pong => {
                self.in_windows[PacketType::Pong as usize].set_and_drag(packet.packet_id);
                let Ok(answered) = parse_ack_payload(&packet.payload) else {
                    return;
                };
                if let Some((ping_id, sent)) = self.outstanding_ping {
                    if answered == ping_id {
                        self.outstanding_ping = None;
                        let rtt = now.saturating_duration_since(sent);
                        self.resend.sample(rtt);
                        self.note_rtt(rtt);
                    }
                }
            }
            PacketType::Ack | PacketType::AckLow => {
                self.in_windows[packet.packet_type as usize].set_and_drag(packet.packet_id);
                let Ok(acked) = parse_ack_payload(&packet.payload) else {
                    return;
                };
                let acked_kind = if packet.packet_type == PacketType::Ack {
                    PacketType::Command
                } else {
                    PacketType::CommandLow
                };
                if let Some(rtt) = self.resend.ack(acked_kind, acked, now) {
                    self.note_rtt(rtt);
                }
            }
            PacketType::Init1 => self.handle_init1(&packet, now),
        }
    }

    /// Commands are acked even when duplicated, so the sender's resend
    /// timer stops; an id outside the receive window was never buffered
    /// and gets no ack at all. Only newly completed messages surface
    /// upward.
    fn handle_command_packet(&mut self, packet: Packet, now: Instant) {
        let kind = packet.packet_type;
        let id = packet.packet_id;
        let state = if kind == PacketType::Command {
            self.commands.is_set(id)
        } else {
            self.commands_low.is_set(id)
        };
        if state == SetState::OutOfWindowNotSet {
            trace!(id, ?kind, "command outside the receive window");
            return;
        }
        if let Some(ack_kind) = kind.ack_kind() {
            if let Err(error) = self.send_packet(ack_kind, PacketFlags::new(), ack_payload(id), now)
            {
                debug!(%error, "ack not sent");
            }
        }
        if state != SetState::InWindowNotSet {
            trace!(?state, id, "duplicate command, re-acked");
            return;
        }

        let queue = if kind == PacketType::Command {
            &mut self.commands
        } else {
            &mut self.commands_low
        };
        if let Err(error) = queue.set(packet) {
            debug!(%error, id, "command not queued");
            return;
        }

        let mut completed = Vec::new();
        loop {
            match queue.try_dequeue() {
                Ok(Some(message)) => completed.push(message.payload),
                Ok(None) => break,
                Err(error) => {
                    debug!(%error, "command assembly failed");
                    break;
                }
            }
        }

        for payload in completed {
            if self.state == ConnectionState::Connecting && self.handle_init_command(&payload, now)
            {
                continue;
            }
            let _ = self.events.send(Event::Command(payload));
        }
    }

    fn handle_init1(&mut self, packet: &Packet, now: Instant) {
        if self.state != ConnectionState::Connecting {
            trace!("init1 outside of handshake");
            return;
        }
        let init_command = Command::new("clientinitiv")
            .arg("alpha", BASE64.encode(self.alpha))
            .arg("omega", self.config.identity.public_key_string())
            .arg("ot", "1")
            .encode();
        let timestamp = self.init_timestamp;
        let Some(machine) = self.handshake.as_mut() else {
            return;
        };

        match machine.handle(&packet.payload, &init_command, timestamp) {
            Ok(Init1Reply::Send(reply) | Init1Reply::Finish(reply)) => {
                if let Err(error) =
                    self.send_packet(PacketType::Init1, PacketFlags::new(), reply, now)
                {
                    debug!(%error, "init reply not sent");
                }
            }
            Err(error) => {
                warn!(%error, "handshake failed");
                self.teardown(Reason::Error);
            }
        }
    }

    /// Intercept the server's `initiv` answer during key negotiation.
    /// Returns true when the payload was consumed.
    fn handle_init_command(&mut self, payload: &[u8], now: Instant) -> bool {
        let Some(command) = Command::parse(payload) else {
            return false;
        };
        if command.name != "initiv" {
            return false;
        }
        match self.finish_key_negotiation(&command) {
            Ok(()) => {
                self.handshake = None;
                self.state = ConnectionState::Connected;
                self.last_ping_sent = Some(now);
                let _ = self.events.send(Event::Connected);
            }
            Err(error) => {
                warn!(%error, "key negotiation failed");
                self.teardown(Reason::Error);
            }
        }
        true
    }

    fn finish_key_negotiation(&mut self, command: &Command) -> Result<(), ConnectionError> {
        let beta_raw = BASE64
            .decode(field(command, "beta")?)
            .map_err(|_| HandshakeError::MalformedField("beta"))?;
        let beta: [u8; 10] = beta_raw
            .try_into()
            .map_err(|_| HandshakeError::MalformedField("beta"))?;
        let omega = parse_public_key(field(command, "omega")?)
            .map_err(|_| HandshakeError::MalformedField("omega"))?;

        // The server's reply fixes the agreement scheme for this attempt:
        // a license field binds the walked chain key into the secret.
        let scheme = match command.get("l") {
            Some(encoded) => {
                let license = BASE64
                    .decode(encoded)
                    .map_err(|_| HandshakeError::MalformedField("l"))?;
                let chain = LicenseChain::parse_and_verify(&license, &self.config.license_root)?;
                KeyScheme::LicenseChain(chain.derive_public_key(&self.config.license_root)?)
            }
            None => KeyScheme::EcdhP256,
        };

        let secret = self.config.identity.negotiate_secret(&omega, &scheme);
        self.crypto.crypto_init(&self.alpha, &beta, &secret);
        Ok(())
    }

    fn note_rtt(&mut self, rtt: Duration) {
        let estimator = self.resend.estimator();
        self.stats
            .record_rtt(rtt, estimator.srtt(), estimator.rttvar());
    }

    /// The single teardown path: releases all in-flight state and emits
    /// `Disconnected` exactly once.
    fn teardown(&mut self, reason: Reason) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnected;
        self.handshake = None;
        self.resend.clear();
        self.outstanding_ping = None;
        self.last_ping_sent = None;
        self.crypto.reset();
        let _ = self.events.send(Event::Disconnected(reason));
    }
}

/// The async connection handle.
pub struct Connection {
    core: Arc<Mutex<ConnectionCore>>,
    socket: UdpConnection,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Connection {
    /// Open a socket to `remote` and start the handshake. Events arrive
    /// through [`next_event`](Self::next_event).
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Io` for socket failures.
    pub async fn connect(
        config: ConnectionConfig,
        remote: SocketAddr,
    ) -> Result<Self, ConnectionError> {
        let socket = UdpConnection::connect(remote).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut initial = ConnectionCore::new(config, tx, Instant::now());
        initial.connect(Instant::now(), unix_timestamp())?;
        let core = Arc::new(Mutex::new(initial));
        flush(&core, &socket).await?;

        let recv_core = Arc::clone(&core);
        let recv_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let len = match recv_socket.recv(&mut buf).await {
                    Ok(len) => len,
                    Err(_) => break,
                };
                let disconnected = {
                    let Ok(mut core) = recv_core.lock() else { break };
                    core.handle_datagram(&buf[..len], Instant::now());
                    core.state() == ConnectionState::Disconnected
                };
                if flush(&recv_core, &recv_socket).await.is_err() || disconnected {
                    recv_socket.close();
                    break;
                }
            }
        });

        let tick_core = Arc::clone(&core);
        let tick_socket = socket.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tick_socket.is_closed() {
                    break;
                }
                let disconnected = {
                    let Ok(mut core) = tick_core.lock() else { break };
                    core.tick(Instant::now());
                    core.state() == ConnectionState::Disconnected
                };
                if flush(&tick_core, &tick_socket).await.is_err() || disconnected {
                    tick_socket.close();
                    break;
                }
            }
        });

        Ok(Self {
            core,
            socket,
            events: rx,
        })
    }

    /// Wait for the next connection event. `None` after teardown once the
    /// queue drains.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Send a command.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Closed` once disconnected, or the
    /// underlying send error.
    pub async fn send_command(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        {
            let Ok(mut core) = self.core.lock() else {
                return Err(ConnectionError::Closed);
            };
            core.send_command(payload, Instant::now())?;
        }
        flush(&self.core, &self.socket).await
    }

    /// Send a voice frame.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::VoiceTooLarge`, `ConnectionError::Closed`
    /// or the underlying send error.
    pub async fn send_voice(&self, frame: &VoiceFrame) -> Result<(), ConnectionError> {
        {
            let Ok(mut core) = self.core.lock() else {
                return Err(ConnectionError::Closed);
            };
            core.send_voice(frame, Instant::now())?;
        }
        flush(&self.core, &self.socket).await
    }

    /// Install the server-assigned client id.
    pub fn set_client_id(&self, client_id: u16) {
        if let Ok(mut core) = self.core.lock() {
            core.set_client_id(client_id);
        }
    }

    /// Snapshot the traffic counters.
    #[must_use]
    pub fn stats(&self) -> NetworkStats {
        self.core
            .lock()
            .map(|core| core.stats().clone())
            .unwrap_or_default()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.core
            .lock()
            .map(|core| core.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// The bound local address.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Io`.
    pub fn local_addr(&self) -> Result<SocketAddr, ConnectionError> {
        self.socket.local_addr()
    }

    /// Leave the server and tear the connection down.
    pub async fn disconnect(&self) {
        if let Ok(mut core) = self.core.lock() {
            core.disconnect(Instant::now());
        }
        let _ = flush(&self.core, &self.socket).await;
        self.socket.close();
    }
}

async fn flush(
    core: &Arc<Mutex<ConnectionCore>>,
    socket: &UdpConnection,
) -> Result<(), ConnectionError> {
    let outgoing = {
        let Ok(mut core) = core.lock() else {
            return Err(ConnectionError::Closed);
        };
        core.take_outgoing()
    };
    for wire in outgoing {
        socket.send(&wire).await?;
    }
    Ok(())
}

fn field<'a>(command: &'a Command, key: &'static str) -> Result<&'a str, HandshakeError> {
    command.get(key).ok_or(HandshakeError::MissingField(key))
}

fn unix_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{WhisperTarget, MAC_SIZE};

    const TYPE_BYTE: usize = MAC_SIZE + 4;

    fn core() -> (ConnectionCore, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let identity = Identity::generate(&mut rand::rngs::OsRng);
        (
            ConnectionCore::new(ConnectionConfig::new(identity), tx, Instant::now()),
            rx,
        )
    }

    /// A core past its handshake, plus the drained Init1 datagram.
    fn connected_core() -> (ConnectionCore, mpsc::UnboundedReceiver<Event>, Instant) {
        let now = Instant::now();
        let (mut core, rx) = core();
        core.connect(now, 1_700_000_000).unwrap();
        core.take_outgoing();
        core.state = ConnectionState::Connected;
        (core, rx, now)
    }

    fn incompressible(len: usize) -> Vec<u8> {
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    /// Seal a server-to-client packet the way a dummy-key server would.
    fn server_seal(mut packet: Packet) -> Vec<u8> {
        let mut crypto = CryptoSession::new();
        let mac = crypto.encrypt_packet(&mut packet).unwrap();
        packet.to_wire(&mac)
    }

    #[test]
    fn test_connect_emits_step0() {
        let now = Instant::now();
        let (mut core, _rx) = core();
        core.connect(now, 42).unwrap();

        let out = core.take_outgoing();
        assert_eq!(out.len(), 1);
        // Init1 nibble, fixed packet id
        assert_eq!(out[0][TYPE_BYTE] & 0x0F, 8);
        assert_eq!(u16::from_be_bytes([out[0][8], out[0][9]]), 0x65);
        // step 0 payload is 21 bytes
        assert_eq!(out[0].len(), MAC_SIZE + 5 + 21);

        assert!(matches!(core.connect(now, 42), Err(ConnectionError::Closed)));
    }

    #[test]
    fn test_large_command_fans_out_into_fragments() {
        let (mut core, _rx, now) = connected_core();
        core.send_command(&incompressible(2000), now).unwrap();

        let out = core.take_outgoing();
        assert_eq!(out.len(), 5);
        for (index, wire) in out.iter().enumerate() {
            assert_eq!(wire[TYPE_BYTE] & 0x0F, 2);
            assert_eq!(u16::from_be_bytes([wire[8], wire[9]]), index as u16);
            let fragmented = wire[TYPE_BYTE] & PacketFlags::FRAGMENTED != 0;
            assert_eq!(fragmented, index != 4, "fragment {index}");
        }
        // Original flags only on the first fragment
        assert_ne!(out[0][TYPE_BYTE] & PacketFlags::NEWPROTOCOL, 0);
        assert_eq!(out[1][TYPE_BYTE] & PacketFlags::NEWPROTOCOL, 0);
        // Every fragment awaits its ack
        assert_eq!(core.resend.len(), 5);
    }

    #[test]
    fn test_compressible_command_shrinks_to_one_packet() {
        let (mut core, _rx, now) = connected_core();
        core.send_command(&vec![0u8; 2000], now).unwrap();

        let out = core.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_ne!(out[0][TYPE_BYTE] & PacketFlags::COMPRESSED, 0);
    }

    #[test]
    fn test_voice_is_never_split() {
        let (mut core, _rx, now) = connected_core();
        let frame = VoiceFrame {
            seq: 1,
            codec: 4,
            whisper: None,
            audio: vec![0xAA; 600],
        };
        assert!(matches!(
            core.send_voice(&frame, now),
            Err(ConnectionError::VoiceTooLarge(_))
        ));

        let small = VoiceFrame {
            audio: vec![0xAA; 100],
            ..frame
        };
        core.send_voice(&small, now).unwrap();
        let out = core.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][TYPE_BYTE] & 0x0F, 0);
        assert_ne!(out[0][TYPE_BYTE] & PacketFlags::UNENCRYPTED, 0);
        assert!(core.resend.is_empty());
    }

    #[test]
    fn test_whisper_uses_whisper_kind() {
        let (mut core, _rx, now) = connected_core();
        let frame = VoiceFrame {
            seq: 1,
            codec: 4,
            whisper: Some(WhisperTarget {
                channels: vec![1],
                clients: vec![2],
            }),
            audio: vec![0xAA; 50],
        };
        core.send_voice(&frame, now).unwrap();
        let out = core.take_outgoing();
        assert_eq!(out[0][TYPE_BYTE] & 0x0F, 1);

        // Oversized whisper frames error out like plain voice, never
        // compressed or split
        let big = VoiceFrame {
            audio: vec![0xAA; 600],
            ..frame
        };
        assert!(matches!(
            core.send_voice(&big, now),
            Err(ConnectionError::VoiceTooLarge(_))
        ));
        assert!(core.take_outgoing().is_empty());
    }

    #[test]
    fn test_ping_cadence() {
        let (mut core, _rx, now) = connected_core();
        core.last_ping_sent = None;

        core.tick(now);
        assert_eq!(core.take_outgoing().len(), 1);

        core.tick(now + Duration::from_millis(500));
        assert!(core.take_outgoing().is_empty());

        core.tick(now + Duration::from_millis(1000));
        let out = core.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][TYPE_BYTE] & 0x0F, 4);
    }

    #[test]
    fn test_silence_times_out() {
        let (mut core, mut rx, now) = connected_core();
        core.tick(now + PACKET_TIMEOUT - Duration::from_millis(1));
        assert_ne!(core.state(), ConnectionState::Disconnected);
        core.take_outgoing();

        core.tick(now + PACKET_TIMEOUT);
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::Disconnected(Reason::Timeout)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unacked_command_times_out() {
        let (mut core, mut rx, now) = connected_core();
        core.send_command(b"version", now).unwrap();
        core.take_outgoing();

        // Keep the traffic clock fresh so only the pending ack can fire
        core.last_traffic = now + Duration::from_secs(15);
        core.tick(now + PACKET_TIMEOUT);
        assert_eq!(core.state(), ConnectionState::Disconnected);
        let disconnected = std::iter::from_fn(|| rx.try_recv().ok())
            .find(|event| matches!(event, Event::Disconnected(_)));
        assert!(matches!(
            disconnected,
            Some(Event::Disconnected(Reason::Timeout))
        ));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (mut core, mut rx, now) = connected_core();
        core.disconnect(now);
        core.disconnect(now);
        core.disconnect_with(Reason::Kick, now);

        // Farewell command went out
        assert_eq!(core.take_outgoing().len(), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::Disconnected(Reason::LeftServer)
        ));
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            core.send_command(b"x", now),
            Err(ConnectionError::Closed)
        ));
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (mut core, _rx, now) = connected_core();
        let wire = server_seal(Packet::new(
            PacketType::Ping,
            PacketFlags::new().with_unencrypted(),
            0,
            Direction::ServerToClient,
            Vec::new(),
        ));
        core.handle_datagram(&wire, now);

        let out = core.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][TYPE_BYTE] & 0x0F, 5);
        // Pong payload carries the ping id
        assert_eq!(&out[0][TYPE_BYTE + 1..], &[0, 0]);
    }

    #[test]
    fn test_pong_feeds_rtt() {
        let (mut core, _rx, now) = connected_core();
        core.tick(now);
        core.take_outgoing();
        let (ping_id, _) = core.outstanding_ping.unwrap();

        let wire = server_seal(Packet::new(
            PacketType::Pong,
            PacketFlags::new().with_unencrypted(),
            0,
            Direction::ServerToClient,
            ack_payload(ping_id),
        ));
        core.handle_datagram(&wire, now + Duration::from_millis(120));

        assert!(core.outstanding_ping.is_none());
        assert_eq!(core.stats().last_rtt, Some(Duration::from_millis(120)));
    }

    #[test]
    fn test_incoming_command_is_acked_and_surfaced() {
        let (mut core, mut rx, now) = connected_core();
        // Pre-handshake crypto on both ends: the dummy key matches
        let wire = server_seal(Packet::new(
            PacketType::Command,
            PacketFlags::new(),
            0,
            Direction::ServerToClient,
            b"notifytextmessage msg=hi".to_vec(),
        ));
        core.handle_datagram(&wire, now);

        let out = core.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][TYPE_BYTE] & 0x0F, 6);
        match rx.try_recv().unwrap() {
            Event::Command(payload) => assert_eq!(payload, b"notifytextmessage msg=hi"),
            other => panic!("unexpected event {other:?}"),
        }

        // The duplicate is acked again but not surfaced again
        core.handle_datagram(&wire, now);
        assert_eq!(core.take_outgoing().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_out_of_window_command_gets_no_ack() {
        let (mut core, mut rx, now) = connected_core();
        // Way past the receive window: never buffered, so an ack would
        // stop the sender's resend timer for a lost message
        let wire = server_seal(Packet::new(
            PacketType::Command,
            PacketFlags::new(),
            5000,
            Direction::ServerToClient,
            b"notifytextmessage msg=late".to_vec(),
        ));
        core.handle_datagram(&wire, now);

        assert!(core.take_outgoing().is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(core.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_reconnect_starts_a_clean_session() {
        let (mut core, mut rx, now) = connected_core();
        let incoming = server_seal(Packet::new(
            PacketType::Command,
            PacketFlags::new(),
            0,
            Direction::ServerToClient,
            b"notifytextmessage msg=first".to_vec(),
        ));
        core.send_command(b"whoami", now).unwrap();
        core.handle_datagram(&incoming, now);
        assert!(matches!(rx.try_recv(), Ok(Event::Command(_))));

        core.disconnect_with(Reason::Error, now);
        assert!(matches!(
            rx.try_recv(),
            Ok(Event::Disconnected(Reason::Error))
        ));

        core.connect(now, 43).unwrap();
        core.take_outgoing();
        core.state = ConnectionState::Connected;

        // The new session reuses Command id 0 on both sides
        core.send_command(b"whoami", now).unwrap();
        let out = core.take_outgoing();
        assert_eq!(u16::from_be_bytes([out[0][8], out[0][9]]), 0);

        core.handle_datagram(&incoming, now);
        assert!(matches!(rx.try_recv(), Ok(Event::Command(_))));
        assert_eq!(core.take_outgoing().len(), 1);
    }

    #[test]
    fn test_voice_event_and_stale_drop() {
        let (mut core, mut rx, now) = connected_core();
        let frame = VoiceFrame {
            seq: 9,
            codec: 4,
            whisper: None,
            audio: vec![1, 2, 3],
        };
        let seal_voice = |id: u16| {
            server_seal(Packet::new(
                PacketType::Voice,
                PacketFlags::new().with_unencrypted(),
                id,
                Direction::ServerToClient,
                frame.encode(),
            ))
        };

        core.handle_datagram(&seal_voice(5), now);
        assert!(matches!(rx.try_recv().unwrap(), Event::Voice(_)));

        // Window dragged past 0: stale voice is silently dropped
        core.handle_datagram(&seal_voice(0), now);
        assert!(rx.try_recv().is_err());
        assert!(core.take_outgoing().is_empty());
    }

    #[test]
    fn test_ack_removes_pending_entry() {
        let (mut core, _rx, now) = connected_core();
        core.send_command(b"version", now).unwrap();
        core.take_outgoing();
        assert_eq!(core.resend.len(), 1);

        let wire = server_seal(Packet::new(
            PacketType::Ack,
            PacketFlags::new(),
            0,
            Direction::ServerToClient,
            ack_payload(0),
        ));
        core.handle_datagram(&wire, now + Duration::from_millis(50));
        assert!(core.resend.is_empty());
        assert_eq!(core.stats().last_rtt, Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_dummy_key_ack_race() {
        let (mut core, _rx, now) = connected_core();
        core.send_command(b"clientinitiv", now).unwrap();
        core.send_command(b"clientek", now).unwrap();
        core.take_outgoing();
        // Keys switch while the acks are in flight
        core.crypto.set_shared_iv([0x77; 32]);

        let dummy_ack = |acked: u16, id: u16| {
            server_seal(Packet::new(
                PacketType::Ack,
                PacketFlags::new(),
                id,
                Direction::ServerToClient,
                ack_payload(acked),
            ))
        };

        // Ack with id <= 2 sealed under the dummy key is still honored
        core.handle_datagram(&dummy_ack(1, 1), now);
        assert_eq!(core.resend.len(), 1);

        // Beyond the race window the dummy key is not tried
        core.handle_datagram(&dummy_ack(0, 3), now);
        assert_eq!(core.resend.len(), 1);

        // The workaround covers Ack only; a dummy-sealed AckLow is dropped
        // even inside the id range
        core.send_command_low(b"whoami", now).unwrap();
        core.take_outgoing();
        assert_eq!(core.resend.len(), 2);
        let low_ack = server_seal(Packet::new(
            PacketType::AckLow,
            PacketFlags::new(),
            1,
            Direction::ServerToClient,
            ack_payload(0),
        ));
        core.handle_datagram(&low_ack, now);
        assert_eq!(core.resend.len(), 2);
    }

    #[test]
    fn test_garbage_datagrams_dropped_silently() {
        let (mut core, mut rx, now) = connected_core();
        // Too short, bad mac, random noise
        core.handle_datagram(&[0u8; 4], now);
        core.handle_datagram(&[0u8; 13], now);
        core.handle_datagram(&incompressible(40), now);
        assert!(core.take_outgoing().is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(core.state(), ConnectionState::Connected);
        assert_eq!(core.stats().packets_received, 0);
    }
}
