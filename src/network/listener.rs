//! Socket listener
//!
//! Polls the control, data and note sockets without blocking, hands
//! session commands to the [`ProtocolEngine`] and queues MIDI for the
//! sender thread. Nothing in the dispatch path waits on I/O.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::codec::{decode_midi_payload, note_port_midi, Command, NotePacket, RtpPacket};
use crate::constants::MAX_PACKET_SIZE;
use crate::error::{NetworkError, Result};
use crate::midi::{parse_stream, MidiMessage};
use crate::network::queue::SharedWorkQueue;
use crate::network::sender::MidiEvent;
use crate::network::socket::{DatagramSink, ServiceSockets};
use crate::protocol::{PortKind, ProtocolEngine};
use crate::session::SessionHandle;

/// MIDI received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMidi {
    pub ssrc: u32,
    pub sequence: u16,
    pub message: MidiMessage,
}

/// Listener statistics
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub datagrams: AtomicU64,
    pub commands: AtomicU64,
    pub midi_packets: AtomicU64,
    pub note_packets: AtomicU64,
    pub dropped: AtomicU64,
    pub feedback_sent: AtomicU64,
}

impl ListenerStats {
    pub fn datagrams(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }

    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    pub fn midi_packets(&self) -> u64 {
        self.midi_packets.load(Ordering::Relaxed)
    }

    pub fn note_packets(&self) -> u64 {
        self.note_packets.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn feedback_sent(&self) -> u64 {
        self.feedback_sent.load(Ordering::Relaxed)
    }
}

/// Routes one received datagram
pub struct Dispatcher {
    engine: Arc<ProtocolEngine>,
    sink: Arc<dyn DatagramSink>,
    queue: SharedWorkQueue<MidiEvent>,
    inbound: Option<Sender<InboundMidi>>,
    /// Acknowledge every RTP-MIDI packet with RS
    send_feedback: bool,
    stats: Arc<ListenerStats>,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<ProtocolEngine>,
        sink: Arc<dyn DatagramSink>,
        queue: SharedWorkQueue<MidiEvent>,
    ) -> Self {
        Self {
            engine,
            sink,
            queue,
            inbound: None,
            send_feedback: true,
            stats: Arc::new(ListenerStats::default()),
        }
    }

    pub fn with_feedback(mut self, send_feedback: bool) -> Self {
        self.send_feedback = send_feedback;
        self
    }

    /// Receive MIDI from peers on a bounded channel
    pub fn subscribe(&mut self, capacity: usize) -> Receiver<InboundMidi> {
        let (tx, rx) = bounded(capacity);
        self.inbound = Some(tx);
        rx
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        self.stats.clone()
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Send datagrams produced by the engine
    pub fn send_all(&self, outbound: impl IntoIterator<Item = crate::protocol::Outbound>) {
        for out in outbound {
            if let Err(e) = self.sink.send_datagram(out.port, out.dest, &out.datagram) {
                tracing::warn!(dest = %out.dest, "Reply not sent: {}", e);
            }
        }
    }

    pub fn dispatch(&self, port: PortKind, from: SocketAddr, datagram: &[u8]) {
        self.stats.datagrams.fetch_add(1, Ordering::Relaxed);

        match port {
            PortKind::Control | PortKind::Data if Command::is_command(datagram) => {
                self.stats.commands.fetch_add(1, Ordering::Relaxed);
                let replies = self.engine.handle_datagram(datagram, from, port);
                self.send_all(replies);
            }
            PortKind::Data => self.dispatch_rtp(from, datagram),
            PortKind::Note => self.dispatch_note(datagram),
            PortKind::Control => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    %from,
                    len = datagram.len(),
                    "Non-command datagram on control port"
                );
            }
        }
    }

    fn dispatch_rtp(&self, from: SocketAddr, datagram: &[u8]) {
        let packet = match RtpPacket::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%from, "Dropping RTP datagram: {}", e);
                return;
            }
        };

        let ssrc = packet.header.ssrc;
        let handle = match self.engine.registry().find_by_ssrc(ssrc) {
            Some(handle) => handle,
            None => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%from, ssrc, "MIDI from unknown session");
                return;
            }
        };

        let payload = match decode_midi_payload(&packet.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%from, "Dropping MIDI payload: {}", e);
                return;
            }
        };
        self.stats.midi_packets.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            ssrc,
            seq = packet.header.sequence,
            journal = payload.flags.journal,
            "MIDI received"
        );

        for message in parse_stream(payload.commands) {
            if let Some(inbound) = &self.inbound {
                let event = InboundMidi {
                    ssrc,
                    sequence: packet.header.sequence,
                    message: message.clone(),
                };
                if let Err(TrySendError::Full(_)) = inbound.try_send(event) {
                    tracing::warn!("Inbound MIDI subscriber is not keeping up");
                }
            }
            self.enqueue(MidiEvent::from_peer(ssrc, message));
        }

        if self.send_feedback {
            self.acknowledge(handle, packet.header.sequence);
        }
    }

    /// Tell the peer which sequence arrived so it can trim its journal
    fn acknowledge(&self, handle: SessionHandle, sequence: u16) {
        let target = self
            .engine
            .registry()
            .with_session(handle, |state| (state.send_ssrc, state.control_addr()));
        let (send_ssrc, dest) = match target {
            Ok(target) => target,
            Err(_) => return,
        };

        let datagram = match Command::feedback(send_ssrc, sequence).encode() {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::debug!("Feedback not encoded: {}", e);
                return;
            }
        };
        match self.sink.send_datagram(PortKind::Control, dest, &datagram) {
            Ok(()) => {
                self.stats.feedback_sent.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%dest, sequence, "Feedback sent");
            }
            Err(e) => tracing::warn!(%dest, "Feedback not sent: {}", e),
        }
    }

    fn dispatch_note(&self, datagram: &[u8]) {
        self.stats.note_packets.fetch_add(1, Ordering::Relaxed);

        let messages = match NotePacket::decode(datagram) {
            Ok(packet) => parse_stream(&packet.midi_bytes()),
            Err(_) => parse_stream(note_port_midi(datagram)),
        };
        for message in messages {
            self.enqueue(MidiEvent::local(message));
        }
    }

    fn enqueue(&self, event: MidiEvent) {
        if self.queue.push(event).is_err() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Sender queue closed, dropping MIDI");
        }
    }
}

/// Poll loop over the service sockets
pub struct Listener {
    sockets: Arc<ServiceSockets>,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    max_packet_size: usize,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn new(sockets: Arc<ServiceSockets>, dispatcher: Dispatcher, interval: Duration) -> Self {
        Self {
            sockets,
            dispatcher: Arc::new(dispatcher),
            interval,
            max_packet_size: MAX_PACKET_SIZE,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Size of the receive buffer; longer datagrams are truncated and dropped
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size.min(MAX_PACKET_SIZE);
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Read every waiting datagram once. Returns how many were handled.
    pub fn poll_once(sockets: &ServiceSockets, dispatcher: &Dispatcher, buf: &mut [u8]) -> usize {
        let mut handled = 0;

        for port in [PortKind::Control, PortKind::Data, PortKind::Note] {
            loop {
                match sockets.try_recv(port, buf) {
                    Ok(Some((len, from))) => {
                        dispatcher.dispatch(port, from, &buf[..len]);
                        handled += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(?port, "{}", e);
                        break;
                    }
                }
            }
        }
        handled
    }

    /// Start the poll thread
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let running = self.running.clone();
        let sockets = self.sockets.clone();
        let dispatcher = self.dispatcher.clone();
        let interval = self.interval;
        let mut buf = vec![0u8; self.max_packet_size];

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("rtpmidi-listener".to_string())
            .spawn(move || {
                tracing::info!("Listener started");
                while running.load(Ordering::Relaxed) {
                    if Self::poll_once(&sockets, &dispatcher, &mut buf) == 0 {
                        thread::sleep(interval);
                    }
                }
                tracing::info!("Listener stopped");
            })
            .map_err(|e| {
                NetworkError::ReceiveFailed(format!("failed to spawn listener: {}", e))
            })?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop polling and wait for the thread
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}
