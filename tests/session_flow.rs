//! End-to-end session tests.
//!
//! Two in-process nodes exchange datagrams through recording sinks:
//!
//! ```text
//!   node A (initiator)                     node B (responder)
//!   ProtocolEngine ── RecordingSink ──pump──► Dispatcher
//!   Dispatcher     ◄──pump── RecordingSink ── ProtocolEngine
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use rtpmidi_session::codec::{Command, RtpPacket};
use rtpmidi_session::midi::MidiMessage;
use rtpmidi_session::network::{
    DatagramSink, Dispatcher, Distributor, InboundMidi, MidiEvent, RecordingSink,
    SharedWorkQueue, WorkQueue,
};
use rtpmidi_session::protocol::{PortKind, ProtocolEngine};
use rtpmidi_session::session::{Registry, SessionHandle, SessionStatus};

const CONTROL: u16 = 5004;
const DATA: u16 = 5005;

struct Node {
    ip: IpAddr,
    engine: Arc<ProtocolEngine>,
    sink: Arc<RecordingSink>,
    queue: SharedWorkQueue<MidiEvent>,
    dispatcher: Dispatcher,
    distributor: Distributor,
    inbound: Receiver<InboundMidi>,
}

impl Node {
    fn new(last_octet: u8, name: &str) -> Self {
        let registry = Arc::new(Registry::new(4));
        let engine = Arc::new(ProtocolEngine::new(registry.clone(), name).unwrap());
        let sink = Arc::new(RecordingSink::new());
        let queue: SharedWorkQueue<MidiEvent> = Arc::new(WorkQueue::new());
        let mut dispatcher = Dispatcher::new(engine.clone(), sink.clone(), queue.clone());
        let inbound = dispatcher.subscribe(64);
        let distributor = Distributor::new(registry, sink.clone(), true);

        Self {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)),
            engine,
            sink,
            queue,
            dispatcher,
            distributor,
            inbound,
        }
    }

    fn addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.ip, port)
    }

    /// Run the sender for everything queued so far
    fn flush_midi(&self) {
        while let Some(event) = self.queue.try_pop() {
            self.distributor.distribute(&event);
        }
    }
}

/// Deliver everything `from` has sent to `to`. Returns the datagram count.
fn pump(from: &Node, to: &Node) -> usize {
    let sent = from.sink.take();
    let count = sent.len();
    for (port, dest, datagram) in sent {
        assert_eq!(dest.ip(), to.ip);
        let (src_port, dest_kind) = match port {
            PortKind::Data => (DATA, PortKind::Data),
            _ => (CONTROL, PortKind::Control),
        };
        assert_eq!(dest.port(), if dest_kind == PortKind::Data { DATA } else { CONTROL });
        to.dispatcher.dispatch(dest_kind, from.addr(src_port), &datagram);
    }
    count
}

/// Exchange datagrams until both sides are quiet
fn settle(a: &Node, b: &Node) {
    for _ in 0..16 {
        if pump(a, b) + pump(b, a) == 0 {
            return;
        }
    }
    panic!("nodes never went quiet");
}

fn connect(a: &Node, b: &Node) -> SessionHandle {
    let (handle, invitation) = a.engine.invite(b.addr(CONTROL)).unwrap();
    a.dispatcher.send_all([invitation]);
    settle(a, b);
    handle
}

#[test]
fn test_handshake_between_nodes() {
    let a = Node::new(1, "alpha");
    let b = Node::new(2, "beta");

    let handle = connect(&a, &b);
    assert_eq!(a.engine.session_status(handle).unwrap(), SessionStatus::Established);

    let b_handle = b.engine.registry().find_by_name("alpha").unwrap();
    let (status, data_port) = b
        .engine
        .registry()
        .with_session(b_handle, |s| (s.status, s.data_port))
        .unwrap();
    assert_eq!(status, SessionStatus::Idle);
    assert_eq!(data_port, DATA);

    // The peer name comes from the accept
    assert_eq!(a.engine.registry().find_by_name("beta"), Some(handle));

    // The initiator finished a sync round and knows the offset
    let offset = a
        .engine
        .registry()
        .with_session(handle, |s| s.offset_estimate)
        .unwrap();
    assert!(offset.is_some());
}

#[test]
fn test_midi_relay_with_journal_and_feedback() {
    let a = Node::new(1, "alpha");
    let b = Node::new(2, "beta");
    let handle = connect(&a, &b);
    let journal_channels = || {
        a.engine
            .registry()
            .with_session(handle, |s| s.journal.total_channels())
            .unwrap()
    };

    // Local note on A's note port reaches B as RTP-MIDI
    a.dispatcher.dispatch(PortKind::Note, a.addr(40000), &[0xaa, 0x90, 60, 100]);
    a.flush_midi();
    assert_eq!(pump(&a, &b), 1);

    let received = b.inbound.try_recv().unwrap();
    assert_eq!(received.message, MidiMessage::NoteOn { channel: 0, note: 60, velocity: 100 });
    assert_eq!(received.sequence, 2);

    // B acknowledges on A's control port; hold that feedback back for now
    let b_ssrc = b
        .engine
        .registry()
        .with_session(b.engine.registry().find_by_name("alpha").unwrap(), |s| s.send_ssrc)
        .unwrap();
    let acks = b.sink.take();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].0, PortKind::Control);
    assert_eq!(acks[0].1, a.addr(CONTROL));
    let stale = acks[0].2.clone();
    assert_eq!(Command::decode(&stale).unwrap(), Command::feedback(b_ssrc, 2));

    // B re-queues it for its other peers; A is the originator and is skipped
    b.flush_midi();
    assert!(b.sink.is_empty());

    // A second event carries A's journal
    a.dispatcher.dispatch(PortKind::Note, a.addr(40000), &[0x80, 60, 0]);
    a.flush_midi();
    let sent = a.sink.take();
    assert_eq!(sent.len(), 1);
    let packet = RtpPacket::decode(&sent[0].2).unwrap();
    assert_eq!(packet.header.sequence, 3);
    assert_ne!(packet.payload[0] & 0x40, 0);
    assert_eq!(journal_channels(), 1);

    // Feedback for sequence 2 is older than the journal and changes nothing
    a.dispatcher.dispatch(PortKind::Control, b.addr(CONTROL), &stale);
    assert_eq!(journal_channels(), 1);

    // Delivering sequence 3 makes B acknowledge it and A drops its journal
    a.sink.send_datagram(sent[0].0, sent[0].1, &sent[0].2).unwrap();
    assert_eq!(pump(&a, &b), 1);
    assert_eq!(pump(&b, &a), 1);
    assert_eq!(journal_channels(), 0);
    assert_eq!(b.dispatcher.stats().feedback_sent(), 2);
}

#[test]
fn test_teardown_frees_both_sides() {
    let a = Node::new(1, "alpha");
    let b = Node::new(2, "beta");
    let handle = connect(&a, &b);

    let end = a.engine.teardown(handle).unwrap();
    a.dispatcher.send_all([end]);
    settle(&a, &b);

    assert_eq!(a.engine.registry().active_count(), 0);
    assert_eq!(b.engine.registry().active_count(), 0);

    // Both sides can connect again
    let handle = connect(&a, &b);
    assert_eq!(a.engine.session_status(handle).unwrap(), SessionStatus::Established);
    assert_eq!(b.engine.registry().active_count(), 1);
}

#[test]
fn test_periodic_sync_round() {
    let a = Node::new(1, "alpha");
    let b = Node::new(2, "beta");
    let handle = connect(&a, &b);

    a.engine
        .registry()
        .with_session(handle, |s| s.offset_estimate = None)
        .unwrap();
    a.dispatcher.send_all(a.engine.sync_tick());
    settle(&a, &b);

    let offset = a
        .engine
        .registry()
        .with_session(handle, |s| s.offset_estimate)
        .unwrap();
    assert!(offset.is_some());
}
