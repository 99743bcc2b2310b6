//! AppleMIDI session protocol
//!
//! [`ProtocolEngine`] turns one inbound command into registry/journal
//! updates plus the datagrams to send back. It never blocks on I/O; the
//! listener owns the sockets and sends whatever the engine returns.
//!
//! Responder side (peer invites us):
//! ```text
//!   IN (control) ──► register, Idle      ──► OK
//!   IN (data)    ──► record data port     ──► OK
//!   CK n         ──► stamp slot n+1       ──► CK (n+1) mod 3
//!   RS seq       ──► seq >= ours: clear journal
//!   BY           ──► reset, slot Unused
//! ```
//! The initiator side lives in [`initiator`].

pub mod initiator;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::command::MAX_NAME_LEN;
use crate::codec::{Command, SessionPayload, SyncPayload};
use crate::error::{CodecError, Error, Result, SessionError};
use crate::session::{Registration, Registry, SessionHandle, SessionRole, SessionStatus};

/// Local socket a datagram arrived on or leaves from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Control,
    Data,
    Note,
}

/// Datagram the caller should send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub dest: SocketAddr,
    pub port: PortKind,
    pub datagram: Bytes,
}

impl Outbound {
    fn command(dest: SocketAddr, port: PortKind, command: &Command) -> Result<Self> {
        Ok(Self {
            dest,
            port,
            datagram: command.encode()?,
        })
    }
}

/// Session protocol state machine
pub struct ProtocolEngine {
    registry: Arc<Registry>,
    service_name: String,
    /// Port for periodic initiator sync
    sync_port: PortKind,
}

impl ProtocolEngine {
    /// Create an engine answering as `service_name`
    pub fn new(registry: Arc<Registry>, service_name: impl Into<String>) -> Result<Self> {
        let service_name = service_name.into();
        if service_name.len() > MAX_NAME_LEN {
            return Err(CodecError::PacketTooLarge(service_name.len()).into());
        }
        Ok(Self {
            registry,
            service_name,
            sync_port: PortKind::Control,
        })
    }

    /// Send periodic sync on the data port instead of the control port
    pub fn with_sync_port(mut self, port: PortKind) -> Self {
        self.sync_port = port;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Decode and handle one command datagram. Failures are logged and
    /// produce no reply.
    pub fn handle_datagram(
        &self,
        datagram: &[u8],
        from: SocketAddr,
        port: PortKind,
    ) -> Vec<Outbound> {
        let result = Command::decode(datagram)
            .map_err(Error::from)
            .and_then(|command| self.handle_command(command, from, port));

        match result {
            Ok(outbound) => outbound,
            Err(Error::Session(
                e @ (SessionError::NoSession(_) | SessionError::UnknownInitiator(_)),
            )) => {
                tracing::warn!(%from, "Dropping command: {}", e);
                Vec::new()
            }
            Err(Error::Codec(e)) if e.is_incomplete() => {
                tracing::debug!(%from, "Dropping truncated command: {}", e);
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(%from, ?port, "Command failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Apply a decoded command
    pub fn handle_command(
        &self,
        command: Command,
        from: SocketAddr,
        port: PortKind,
    ) -> Result<Vec<Outbound>> {
        tracing::debug!(
            %from,
            ?port,
            tag = command.tag().as_str(),
            ssrc = command.ssrc(),
            "Command received"
        );

        match command {
            Command::Invitation(payload) => self.on_invitation(payload, from, port),
            Command::Accept(payload) => self.on_accept(payload, from, port),
            Command::Reject(payload) => self.on_reject(payload),
            Command::End(payload) => self.on_end(payload),
            Command::Sync(sync) => self.on_sync(sync, from, port),
            Command::Feedback { ssrc, last_ack_seq } => self.on_feedback(ssrc, last_ack_seq),
            Command::BitrateLimit { ssrc, limit } => {
                tracing::info!(ssrc, limit, "Peer requested bitrate limit");
                Ok(Vec::new())
            }
        }
    }

    fn session_for_ssrc(&self, ssrc: u32) -> Result<SessionHandle> {
        self.registry
            .find_by_ssrc(ssrc)
            .ok_or_else(|| SessionError::NoSession(ssrc).into())
    }

    fn accept_for(&self, initiator: u32, send_ssrc: u32) -> Command {
        Command::Accept(SessionPayload::new(initiator, send_ssrc, self.service_name.clone()))
    }

    fn on_invitation(
        &self,
        invitation: SessionPayload,
        from: SocketAddr,
        port: PortKind,
    ) -> Result<Vec<Outbound>> {
        if let Some(handle) = self.registry.find_by_ssrc(invitation.ssrc) {
            // Same peer again, typically on its data port
            let send_ssrc = self.registry.with_session(handle, |state| {
                match port {
                    PortKind::Data => state.data_port = from.port(),
                    _ => state.control_port = from.port(),
                }
                state.send_ssrc
            })?;
            tracing::info!(%from, ?port, name = %invitation.name, "Invitation on additional port");
            let reply = self.accept_for(invitation.initiator, send_ssrc);
            return Ok(vec![Outbound::command(from, port, &reply)?]);
        }

        let (control_port, data_port) = match port {
            PortKind::Data => (from.port().wrapping_sub(1), from.port()),
            _ => (from.port(), 0),
        };
        let handle = self.registry.register(Registration {
            ssrc: Some(invitation.ssrc),
            initiator: invitation.initiator,
            addr: from.ip(),
            control_port,
            data_port,
            name: invitation.name.clone(),
            role: SessionRole::Responder,
        })?;
        let send_ssrc = self.registry.with_session(handle, |state| state.send_ssrc)?;

        let reply = self.accept_for(invitation.initiator, send_ssrc);
        match Outbound::command(from, port, &reply) {
            Ok(outbound) => {
                tracing::info!(
                    %from,
                    name = %invitation.name,
                    ssrc = invitation.ssrc,
                    "Accepted invitation"
                );
                Ok(vec![outbound])
            }
            Err(e) => {
                // Leave the registry as it was
                let _ = self.registry.reset(handle);
                Err(e)
            }
        }
    }

    fn on_end(&self, end: SessionPayload) -> Result<Vec<Outbound>> {
        let handle = self.session_for_ssrc(end.ssrc)?;
        self.registry.reset(handle)?;
        tracing::info!(ssrc = end.ssrc, name = %end.name, "Peer ended session");
        Ok(Vec::new())
    }

    fn on_sync(
        &self,
        sync: SyncPayload,
        from: SocketAddr,
        port: PortKind,
    ) -> Result<Vec<Outbound>> {
        let handle = self.session_for_ssrc(sync.ssrc)?;

        let reply = self.registry.with_session(handle, |state| {
            let now = state.elapsed_ticks();
            if sync.count == 2 {
                let offset = sync.offset_estimate();
                state.offset_estimate = Some(offset);
                tracing::debug!(ssrc = sync.ssrc, offset, "Clock offset estimate");
            }
            match (state.role, sync.count) {
                // Third step of an exchange we started
                (SessionRole::Initiator, 2) => None,
                _ => Some(sync.answer(state.send_ssrc, now)),
            }
        })?;

        match reply {
            Some(reply) => Ok(vec![Outbound::command(from, port, &Command::Sync(reply))?]),
            None => Ok(Vec::new()),
        }
    }

    fn on_feedback(&self, ssrc: u32, last_ack_seq: u32) -> Result<Vec<Outbound>> {
        let handle = self.session_for_ssrc(ssrc)?;
        let ack = (last_ack_seq & 0xffff) as u16;
        let cleared = self.registry.with_session(handle, |state| state.acknowledge(ack))?;
        tracing::debug!(ssrc, ack, cleared, "Receiver feedback");
        Ok(Vec::new())
    }

    /// Current status of a session
    pub fn session_status(&self, handle: SessionHandle) -> Result<SessionStatus> {
        Ok(self.registry.with_session(handle, |state| state.status)?)
    }
}
