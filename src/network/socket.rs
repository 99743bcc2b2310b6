//! UDP sockets for the control, data and note ports

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::protocol::PortKind;

/// Anything outbound datagrams can be written to
pub trait DatagramSink: Send + Sync {
    fn send_datagram(
        &self,
        port: PortKind,
        dest: SocketAddr,
        datagram: &[u8],
    ) -> Result<(), NetworkError>;
}

/// Create a non-blocking UDP socket bound to `addr`
pub fn create_socket(addr: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    Ok(socket.into())
}

/// The three service sockets
pub struct ServiceSockets {
    control: UdpSocket,
    data: UdpSocket,
    note: UdpSocket,
}

impl ServiceSockets {
    /// Bind control, data and note ports from the configuration
    pub fn bind(config: &NetworkConfig) -> Result<Self, NetworkError> {
        let ip: IpAddr = config
            .bind_address
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(config.bind_address.clone()))?;

        let control = create_socket(SocketAddr::new(ip, config.control_port))?;
        let data = create_socket(SocketAddr::new(ip, config.data_port()))?;
        let note = create_socket(SocketAddr::new(ip, config.note_port))?;

        tracing::info!(
            control = config.control_port,
            data = config.data_port(),
            note = config.note_port,
            "Sockets bound on {}",
            ip
        );
        Ok(Self { control, data, note })
    }

    pub fn socket(&self, port: PortKind) -> &UdpSocket {
        match port {
            PortKind::Control => &self.control,
            PortKind::Data => &self.data,
            PortKind::Note => &self.note,
        }
    }

    /// Receive one datagram if any is waiting
    pub fn try_recv(
        &self,
        port: PortKind,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddr)>, NetworkError> {
        match self.socket(port).recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(NetworkError::ReceiveFailed(e.to_string())),
        }
    }

    pub fn local_addr(&self, port: PortKind) -> Result<SocketAddr, NetworkError> {
        self.socket(port)
            .local_addr()
            .map_err(|e| NetworkError::InvalidAddress(e.to_string()))
    }
}

impl DatagramSink for ServiceSockets {
    fn send_datagram(
        &self,
        port: PortKind,
        dest: SocketAddr,
        datagram: &[u8],
    ) -> Result<(), NetworkError> {
        self.socket(port)
            .send_to(datagram, dest)
            .map(|_| ())
            .map_err(|e| NetworkError::SendFailed(format!("{}: {}", dest, e)))
    }
}

/// Sink that keeps every datagram in memory
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(PortKind, SocketAddr, Vec<u8>)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything recorded so far
    pub fn take(&self) -> Vec<(PortKind, SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DatagramSink for RecordingSink {
    fn send_datagram(
        &self,
        port: PortKind,
        dest: SocketAddr,
        datagram: &[u8],
    ) -> Result<(), NetworkError> {
        self.sent.lock().push((port, dest, datagram.to_vec()));
        Ok(())
    }
}
