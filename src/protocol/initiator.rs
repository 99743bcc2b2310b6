//! Initiator side of the session protocol
//!
//! ```text
//!   invite()        ──► IN on control port      AwaitingFirstInv
//!   OK (first)      ──► IN on data port         AwaitingSecondInv
//!   OK (second)     ──► CK count 0              Established
//!   sync_tick()     ──► CK count 0 to every established session
//!   CK 1            ──► CK 2
//!   CK 2            ──► offset estimate, no reply
//!   NO              ──► reset
//!   teardown()      ──► BY, reset
//! ```

use std::net::SocketAddr;

use rand::Rng;

use super::{Outbound, PortKind, ProtocolEngine};
use crate::codec::{Command, SessionPayload, SyncPayload};
use crate::error::{Result, SessionError};
use crate::session::{Registration, SessionHandle, SessionRole, SessionStatus};

impl ProtocolEngine {
    /// Invite the peer whose control port is `addr`.
    ///
    /// Registers the outbound session and returns the first invitation.
    pub fn invite(&self, addr: SocketAddr) -> Result<(SessionHandle, Outbound)> {
        let initiator = self.fresh_initiator_token();
        let handle = self.registry.register(Registration {
            ssrc: None,
            initiator,
            addr: addr.ip(),
            control_port: addr.port(),
            data_port: addr.port().wrapping_add(1),
            name: addr.to_string(),
            role: SessionRole::Initiator,
        })?;

        let send_ssrc = self.registry.with_session(handle, |state| state.send_ssrc)?;
        let invitation = Command::Invitation(SessionPayload::new(
            initiator,
            send_ssrc,
            self.service_name.clone(),
        ));

        let outbound = match Outbound::command(addr, PortKind::Control, &invitation) {
            Ok(outbound) => outbound,
            Err(e) => {
                let _ = self.registry.reset(handle);
                return Err(e);
            }
        };
        self.registry
            .with_session(handle, |state| state.status = SessionStatus::AwaitingFirstInv)?;

        tracing::info!(%addr, initiator, "Inviting remote peer");
        Ok((handle, outbound))
    }

    fn fresh_initiator_token(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let token: u32 = rng.gen();
            if token != 0 && self.registry.find_by_initiator(token).is_none() {
                return token;
            }
        }
    }

    pub(super) fn on_accept(
        &self,
        accept: SessionPayload,
        from: SocketAddr,
        port: PortKind,
    ) -> Result<Vec<Outbound>> {
        let handle = self
            .registry
            .find_by_initiator(accept.initiator)
            .ok_or(SessionError::UnknownInitiator(accept.initiator))?;

        if let Some(existing) = self.registry.find_by_ssrc(accept.ssrc) {
            if existing != handle {
                tracing::warn!(ssrc = accept.ssrc, "Accept carries ssrc of another session");
                return Err(SessionError::DuplicateSsrc(accept.ssrc).into());
            }
        }

        let service_name = self.service_name.clone();
        let outbound = self.registry.with_session(handle, |state| -> Result<Option<Outbound>> {
            match state.status {
                SessionStatus::AwaitingFirstInv => {
                    let invitation = Command::Invitation(SessionPayload::new(
                        state.initiator,
                        state.send_ssrc,
                        service_name,
                    ));
                    let outbound =
                        Outbound::command(state.data_addr(), PortKind::Data, &invitation)?;
                    state.ssrc = Some(accept.ssrc);
                    if !accept.name.is_empty() {
                        state.name = accept.name.clone();
                    }
                    state.status = SessionStatus::AwaitingSecondInv;
                    tracing::info!(peer = %from, name = %state.name, "Control port accepted");
                    Ok(Some(outbound))
                }
                SessionStatus::AwaitingSecondInv => {
                    let sync =
                        Command::Sync(SyncPayload::start(state.send_ssrc, state.elapsed_ticks()));
                    let outbound =
                        Outbound::command(state.control_addr(), PortKind::Control, &sync)?;
                    state.status = SessionStatus::Established;
                    tracing::info!(peer = %from, name = %state.name, "Session established");
                    Ok(Some(outbound))
                }
                status => {
                    tracing::debug!(peer = %from, ?port, %status, "Ignoring unexpected accept");
                    Ok(None)
                }
            }
        })??;

        Ok(outbound.into_iter().collect())
    }

    pub(super) fn on_reject(&self, reject: SessionPayload) -> Result<Vec<Outbound>> {
        let handle = self
            .registry
            .find_by_initiator(reject.initiator)
            .ok_or(SessionError::UnknownInitiator(reject.initiator))?;

        let pending = self.registry.with_session(handle, |state| {
            state.role == SessionRole::Initiator && state.status != SessionStatus::Established
        })?;
        if pending {
            self.registry.reset(handle)?;
            tracing::warn!(name = %reject.name, "Invitation rejected by peer");
        } else {
            tracing::debug!(name = %reject.name, "Ignoring reject for settled session");
        }
        Ok(Vec::new())
    }

    /// Start a clock sync round with every established outbound session
    pub fn sync_tick(&self) -> Vec<Outbound> {
        let handles = self.registry.handles_where(|state| {
            state.role == SessionRole::Initiator && state.status == SessionStatus::Established
        });

        let sync_port = self.sync_port;
        handles
            .into_iter()
            .filter_map(|handle| {
                self.registry
                    .with_session(handle, |state| {
                        let dest = match sync_port {
                            PortKind::Data => state.data_addr(),
                            _ => state.control_addr(),
                        };
                        let start = SyncPayload::start(state.send_ssrc, state.elapsed_ticks());
                        Outbound::command(dest, sync_port, &Command::Sync(start))
                    })
                    .ok()
                    .and_then(|result| result.ok())
            })
            .collect()
    }

    /// Say goodbye to a peer and free its slot
    pub fn teardown(&self, handle: SessionHandle) -> Result<Outbound> {
        let service_name = self.service_name.clone();
        let outbound = self.registry.with_session(handle, |state| {
            let end =
                Command::End(SessionPayload::new(state.initiator, state.send_ssrc, service_name));
            Outbound::command(state.control_addr(), PortKind::Control, &end)
        })??;
        self.registry.reset(handle)?;
        tracing::info!(dest = %outbound.dest, "Session torn down");
        Ok(outbound)
    }

    /// Tear down every session
    pub fn teardown_all(&self) -> Vec<Outbound> {
        self.registry
            .handles()
            .into_iter()
            .filter_map(|handle| match self.teardown(handle) {
                Ok(outbound) => Some(outbound),
                Err(e) => {
                    tracing::warn!("Teardown failed: {}", e);
                    None
                }
            })
            .collect()
    }
}
