//! MIDI distribution to every active session
//!
//! The listener queues MIDI events; a dedicated sender thread drains the
//! queue and fans each event out to every active session except the one
//! it came from, attaching that session's recovery journal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::payload::{header_len, write_midi_payload, PayloadFlags};
use crate::codec::rtp::RTP_HEADER_SIZE;
use crate::codec::{RtpHeader, RtpPacket};
use crate::constants::MAX_PACKET_SIZE;
use crate::error::{CodecError, NetworkError, Result};
use crate::midi::MidiMessage;
use crate::network::queue::{SharedWorkQueue, WorkQueue};
use crate::network::socket::DatagramSink;
use crate::protocol::PortKind;
use crate::session::{Registry, SessionHandle, SessionState};

/// One MIDI message waiting to be distributed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    /// Peer ssrc the event came from; that peer is skipped
    pub originator: Option<u32>,
    pub message: MidiMessage,
}

impl MidiEvent {
    /// Event produced locally
    pub fn local(message: MidiMessage) -> Self {
        Self {
            originator: None,
            message,
        }
    }

    /// Event received from a peer
    pub fn from_peer(ssrc: u32, message: MidiMessage) -> Self {
        Self {
            originator: Some(ssrc),
            message,
        }
    }
}

/// Sender statistics
#[derive(Debug, Default)]
pub struct SenderStats {
    pub events: AtomicU64,
    pub packets_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub encode_errors: AtomicU64,
    /// Journals dropped because they no longer fit in one packet
    pub journal_resets: AtomicU64,
}

impl SenderStats {
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    pub fn encode_errors(&self) -> u64 {
        self.encode_errors.load(Ordering::Relaxed)
    }

    pub fn journal_resets(&self) -> u64 {
        self.journal_resets.load(Ordering::Relaxed)
    }
}

/// Builds and sends RTP-MIDI packets for each session
pub struct Distributor {
    registry: Arc<Registry>,
    sink: Arc<dyn DatagramSink>,
    /// Record sent events into each session's journal
    journal_write: bool,
    /// Largest datagram sent to a peer
    max_packet_size: usize,
    stats: Arc<SenderStats>,
}

impl Distributor {
    pub fn new(registry: Arc<Registry>, sink: Arc<dyn DatagramSink>, journal_write: bool) -> Self {
        Self {
            registry,
            sink,
            journal_write,
            max_packet_size: MAX_PACKET_SIZE,
            stats: Arc::new(SenderStats::default()),
        }
    }

    /// Cap outbound datagrams below the UDP maximum
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size.min(MAX_PACKET_SIZE);
        self
    }

    pub fn stats(&self) -> Arc<SenderStats> {
        self.stats.clone()
    }

    /// Send one event to every active session but its originator.
    /// Returns the number of sessions it was sent to.
    pub fn distribute(&self, event: &MidiEvent) -> usize {
        self.stats.events.fetch_add(1, Ordering::Relaxed);

        let commands = event.message.to_bytes();
        let targets = self.registry.handles_where(|state| {
            state.status.is_active()
                && (event.originator.is_none() || state.ssrc != event.originator)
        });

        targets
            .into_iter()
            .filter(|handle| self.send_to(*handle, event, &commands))
            .count()
    }

    fn send_to(&self, handle: SessionHandle, event: &MidiEvent, commands: &[u8]) -> bool {
        let result = self.registry.with_session(handle, |state| {
            // Session may have been reset or re-registered since the scan
            if !state.status.is_active() {
                return Ok(false);
            }
            self.send_locked(state, &event.message, commands).map(|_| true)
        });

        match result {
            Ok(Ok(sent)) => sent,
            Ok(Err(e)) => {
                tracing::warn!(slot = handle.index(), "MIDI send failed: {}", e);
                false
            }
            Err(_) => false,
        }
    }

    fn send_locked(
        &self,
        state: &mut SessionState,
        message: &MidiMessage,
        commands: &[u8],
    ) -> Result<()> {
        let fixed = RTP_HEADER_SIZE + header_len(commands.len()) + commands.len();
        if fixed > self.max_packet_size {
            self.stats.encode_errors.fetch_add(1, Ordering::Relaxed);
            return Err(CodecError::PacketTooLarge(fixed).into());
        }

        let mut journal = state.journal.pack();
        if fixed + journal.len() > self.max_packet_size {
            // Peer has not acknowledged for too long; start a fresh journal
            self.stats.journal_resets.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                dest = %state.data_addr(),
                journal = journal.len(),
                "Recovery journal no longer fits in one packet, resetting it"
            );
            state.journal.reset();
            journal = Bytes::new();
        }

        let flags = PayloadFlags::with_journal(!journal.is_empty());
        let mut payload = BytesMut::with_capacity(2 + commands.len() + journal.len());
        if let Err(e) = write_midi_payload(&mut payload, flags, commands) {
            self.stats.encode_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
        payload.put_slice(&journal);

        let seq = state.seq.wrapping_add(1);
        let header = RtpHeader::midi(seq, state.rtp_timestamp(), state.send_ssrc);
        let datagram = match RtpPacket::new(header, payload.freeze()).encode() {
            Ok(datagram) => datagram,
            Err(e) => {
                self.stats.encode_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        state.seq = seq;

        let dest = state.data_addr();
        if let Err(e) = self.sink.send_datagram(PortKind::Data, dest, &datagram) {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%dest, seq, journal = journal.len(), "MIDI sent");

        if self.journal_write {
            state.record(message);
        }
        Ok(())
    }
}

/// Sender worker thread consuming the MIDI queue
pub struct MidiSender {
    queue: SharedWorkQueue<MidiEvent>,
    stats: Arc<SenderStats>,
    thread_handle: Option<JoinHandle<()>>,
}

impl MidiSender {
    /// Spawn the worker around `distributor`
    pub fn start(distributor: Distributor) -> Result<Self> {
        let queue: SharedWorkQueue<MidiEvent> = Arc::new(WorkQueue::new());
        let stats = distributor.stats();

        let worker_queue = queue.clone();
        let handle = thread::Builder::new()
            .name("midi-sender".to_string())
            .spawn(move || {
                tracing::debug!("MIDI sender started");
                while let Some(event) = worker_queue.pop_blocking() {
                    distributor.distribute(&event);
                }
                tracing::debug!("MIDI sender drained and stopped");
            })
            .map_err(|e| NetworkError::SendFailed(format!("failed to spawn sender: {}", e)))?;

        Ok(Self {
            queue,
            stats,
            thread_handle: Some(handle),
        })
    }

    /// Queue shared with producers
    pub fn queue(&self) -> SharedWorkQueue<MidiEvent> {
        self.queue.clone()
    }

    pub fn enqueue(&self, event: MidiEvent) -> Result<()> {
        Ok(self.queue.push(event)?)
    }

    pub fn stats(&self) -> Arc<SenderStats> {
        self.stats.clone()
    }

    /// Check if the worker is running
    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Signal shutdown and wait for the queue to drain
    pub fn stop(&mut self) {
        self.queue.shutdown();

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MidiSender {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_midi_payload;
    use crate::network::socket::RecordingSink;
    use crate::session::{Registration, SessionRole};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn register(registry: &Registry, ssrc: u32, port: u16) -> SessionHandle {
        registry
            .register(Registration {
                ssrc: Some(ssrc),
                initiator: ssrc,
                addr: IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)),
                control_port: port,
                data_port: port + 1,
                name: format!("peer-{}", ssrc),
                role: SessionRole::Responder,
            })
            .unwrap()
    }

    fn note_on(note: u8) -> MidiMessage {
        MidiMessage::NoteOn { channel: 0, note, velocity: 100 }
    }

    #[test]
    fn test_first_packet_has_no_journal() {
        let registry = Arc::new(Registry::new(4));
        let sink = Arc::new(RecordingSink::new());
        let handle = register(&registry, 1, 5004);
        let distributor = Distributor::new(registry.clone(), sink.clone(), true);

        assert_eq!(distributor.distribute(&MidiEvent::local(note_on(60))), 1);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let (port, dest, datagram) = &sent[0];
        assert_eq!(*port, PortKind::Data);
        assert_eq!(dest.port(), 5005);

        let packet = RtpPacket::decode(datagram).unwrap();
        assert_eq!(packet.header.sequence, 2);
        let payload = decode_midi_payload(&packet.payload).unwrap();
        assert!(!payload.flags.journal);
        assert_eq!(payload.commands, &[0x90, 60, 100]);

        let (seq, journal_seq, totchan) = registry
            .with_session(handle, |s| (s.seq, s.journal.seq(), s.journal.total_channels()))
            .unwrap();
        assert_eq!(seq, 2);
        assert_eq!(journal_seq, 2);
        assert_eq!(totchan, 1);
    }

    #[test]
    fn test_second_packet_carries_journal() {
        let registry = Arc::new(Registry::new(4));
        let sink = Arc::new(RecordingSink::new());
        register(&registry, 1, 5004);
        let distributor = Distributor::new(registry.clone(), sink.clone(), true);

        distributor.distribute(&MidiEvent::local(note_on(60)));
        distributor.distribute(&MidiEvent::local(note_on(62)));

        let sent = sink.take();
        let packet = RtpPacket::decode(&sent[1].2).unwrap();
        assert_eq!(packet.header.sequence, 3);
        let payload = decode_midi_payload(&packet.payload).unwrap();
        assert!(payload.flags.journal);
        // S|A flags, one channel, checkpoint seq 2
        assert_eq!(&payload.trailer[..3], &[0xa0, 0x00, 0x02]);
    }

    #[test]
    fn test_journal_write_disabled() {
        let registry = Arc::new(Registry::new(4));
        let sink = Arc::new(RecordingSink::new());
        let handle = register(&registry, 1, 5004);
        let distributor = Distributor::new(registry.clone(), sink, false);

        distributor.distribute(&MidiEvent::local(note_on(60)));
        let empty = registry.with_session(handle, |s| s.journal.is_empty()).unwrap();
        assert!(empty);
    }

    #[test]
    fn test_originator_is_skipped() {
        let registry = Arc::new(Registry::new(4));
        let sink = Arc::new(RecordingSink::new());
        register(&registry, 1, 5004);
        register(&registry, 2, 6004);
        let distributor = Distributor::new(registry.clone(), sink.clone(), true);

        assert_eq!(distributor.distribute(&MidiEvent::from_peer(1, note_on(60))), 1);
        let sent = sink.take();
        assert_eq!(sent[0].1, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)), 6005));
        assert_eq!(distributor.stats().packets_sent(), 1);
    }

    #[test]
    fn test_pending_sessions_are_skipped() {
        let registry = Arc::new(Registry::new(4));
        let sink = Arc::new(RecordingSink::new());
        let handle = register(&registry, 1, 5004);
        registry
            .with_session(handle, |s| s.status = crate::session::SessionStatus::AwaitingFirstInv)
            .unwrap();
        let distributor = Distributor::new(registry, sink.clone(), true);

        assert_eq!(distributor.distribute(&MidiEvent::local(note_on(60))), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_full_journal_is_reset_instead_of_blocking_sends() {
        let registry = Arc::new(Registry::new(4));
        let sink = Arc::new(RecordingSink::new());
        let handle = register(&registry, 1, 5004);
        let distributor = Distributor::new(registry.clone(), sink.clone(), true);

        // No feedback ever arrives, so the journal keeps growing
        for channel in 0..16u8 {
            for note in 0..127u8 {
                let message = MidiMessage::NoteOn { channel, note, velocity: 100 };
                assert_eq!(distributor.distribute(&MidiEvent::local(message)), 1);
            }
        }

        assert!(distributor.stats().journal_resets() > 0);
        assert_eq!(distributor.stats().encode_errors(), 0);
        assert_eq!(distributor.stats().packets_sent(), 16 * 127);
        for (_, _, datagram) in sink.take() {
            assert!(datagram.len() <= MAX_PACKET_SIZE);
        }

        // Sessions keep receiving after the reset
        assert_eq!(distributor.distribute(&MidiEvent::local(note_on(1))), 1);
        let totchan = registry.with_session(handle, |s| s.journal.total_channels()).unwrap();
        assert!(totchan > 0);
    }

    #[test]
    fn test_small_packet_limit_drops_journal() {
        let registry = Arc::new(Registry::new(4));
        let sink = Arc::new(RecordingSink::new());
        register(&registry, 1, 5004);
        let distributor =
            Distributor::new(registry.clone(), sink.clone(), true).with_max_packet_size(64);

        for note in 0..40 {
            assert_eq!(distributor.distribute(&MidiEvent::local(note_on(note))), 1);
        }

        let sent = sink.take();
        assert_eq!(sent.len(), 40);
        assert!(sent.iter().all(|(_, _, datagram)| datagram.len() <= 64));
        assert!(distributor.stats().journal_resets() > 0);

        // The packet that triggered the reset goes out without a journal
        let bare = sent
            .iter()
            .skip(1)
            .map(|(_, _, datagram)| RtpPacket::decode(datagram).unwrap())
            .filter(|packet| !decode_midi_payload(&packet.payload).unwrap().flags.journal)
            .count();
        assert!(bare > 0);
    }

    #[test]
    fn test_oversized_commands_are_rejected() {
        let registry = Arc::new(Registry::new(4));
        let sink = Arc::new(RecordingSink::new());
        register(&registry, 1, 5004);
        let distributor =
            Distributor::new(registry.clone(), sink.clone(), true).with_max_packet_size(14);

        assert_eq!(distributor.distribute(&MidiEvent::local(note_on(60))), 0);
        assert!(sink.is_empty());
        assert_eq!(distributor.stats().encode_errors(), 1);
    }

    #[test]
    fn test_worker_drains_on_stop() {
        let registry = Arc::new(Registry::new(4));
        let sink = Arc::new(RecordingSink::new());
        register(&registry, 1, 5004);
        register(&registry, 2, 6004);

        let mut sender = MidiSender::start(Distributor::new(registry, sink.clone(), true)).unwrap();
        for note in 0..50 {
            sender.enqueue(MidiEvent::local(note_on(note))).unwrap();
        }
        sender.stop();

        assert!(!sender.is_running());
        assert_eq!(sink.len(), 100);
        assert_eq!(sender.stats().events(), 50);
        assert!(sender.enqueue(MidiEvent::local(note_on(1))).is_err());
    }
}
