//! Network subsystem: UDP sockets, listener loop and MIDI sender

pub mod listener;
pub mod queue;
pub mod sender;
pub mod socket;

pub use listener::{Dispatcher, InboundMidi, Listener, ListenerStats};
pub use queue::{SharedWorkQueue, WorkQueue};
pub use sender::{Distributor, MidiEvent, MidiSender, SenderStats};
pub use socket::{create_socket, DatagramSink, RecordingSink, ServiceSockets};
