// This module contains the relay session.
//
// A session is started for every RRQ or WRQ that reaches the listener. It binds its own socket on
// an ephemeral port, which becomes the TID both peers see for the relay, and then works in
// roughly the following stages:
//
// 1. Forward the request to the server's well-known port (or hold it back, or drop it, if the
//    session's fault says so).
// 2. Wait for the server's first reply. Its source is the server's TID for the rest of the
//    transfer.
// 3. Relay every packet to the opposite peer until the transfer ends or a peer sends an ERROR.
//
// The decisions are made by the RelayProcessor; this module only moves bytes. Receives have no
// timeout: a peer that goes silent stalls its session forever, which is acceptable for a
// hand-driven test tool. Other sessions and the listener are unaffected.

use crate::delayed::DelayedSends;
use crate::fault::FaultSpec;
use crate::processor::{Outgoing, RelayProcessor, ResultAction};
use crate::tftp::{self, Datagram, RelaySocket, SocketError};
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Could not resolve {host}: {reason}")]
    HostResolution { host: String, reason: String },

    #[error(transparent)]
    Transport(#[from] SocketError),
}

/// How a session ended, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The transfer's closing packets went through.
    Completed,
    /// A peer sent an ERROR packet.
    PeerError(String),
    /// The opening request was dropped by a `lose` fault.
    RequestDropped,
}

/// Looks up the server's well-known address. TFTP is IPv4 only.
pub async fn resolve_server(host: &str, port: u16) -> Result<SocketAddr, SessionError> {
    let resolution_error = |reason: String| SessionError::HostResolution { host: host.to_string(), reason };

    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| resolution_error(e.to_string()))?;
    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| resolution_error("no IPv4 address".to_string()))
}

/// One client/server transfer and the socket it runs over.
pub struct RelaySession {
    sock: RelaySocket,
    delayed: DelayedSends,
    processor: RelayProcessor,
}

impl RelaySession {
    pub fn new(request: Datagram, server: SocketAddr, fault: FaultSpec) -> Result<RelaySession, SessionError> {
        let processor = RelayProcessor::new(request, server, fault)?;
        let sock = RelaySocket::bind((Ipv4Addr::UNSPECIFIED, 0).into())?;
        log::info!(
            "New {} session for client {} on {} with fault: {}",
            processor.connection(),
            processor.client(),
            sock.local_addr()?,
            fault
        );

        Ok(RelaySession { delayed: DelayedSends::new(sock.clone()), sock, processor })
    }

    /// Relays packets between client and server until the transfer is over.
    pub async fn run(&mut self) -> Result<SessionOutcome, SessionError> {
        let mut action = self.processor.first_packet();
        loop {
            match action {
                ResultAction::SendAndAwait(sends) => self.dispatch(sends).await?,
                ResultAction::TerminateWithPackets(sends) => {
                    self.dispatch(sends).await?;
                    self.delayed.drain().await;
                    log::info!(
                        "Closing session between {} and {} after {} transfers",
                        self.processor.client(),
                        self.processor.server(),
                        self.processor.transfers()
                    );
                    if self.processor.fault_armed() {
                        log::info!("The transfer finished without its fault firing");
                    }
                    return Ok(SessionOutcome::Completed);
                }
                ResultAction::RetryRecv => {}
                ResultAction::CloseConnection(msg) => {
                    log::warn!("{msg}");
                    if self.delayed.outstanding() > 0 {
                        log::info!("Abandoning {} delayed send(s)", self.delayed.outstanding());
                    }
                    return Ok(SessionOutcome::PeerError(msg));
                }
                ResultAction::RequestDropped => return Ok(SessionOutcome::RequestDropped),
            }

            let datagram = next_datagram(&self.sock).await?;
            log::info!("Received {} from {}", datagram, datagram.src);
            action = self.processor.process_packet(datagram);
        }
    }

    async fn dispatch(&mut self, sends: Vec<Outgoing>) -> tftp::TftpResult<()> {
        for Outgoing { bytes, dst, after } in sends {
            match after {
                Some(wait) => self.delayed.schedule(bytes, dst, wait),
                None => {
                    if let Err(e) = self.sock.send_to(&bytes, dst).await {
                        log::error!("Unable to send {} bytes to {}: {e}", bytes.len(), dst);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Receives the next well-formed datagram. Malformed ones are logged and never relayed.
async fn next_datagram(sock: &RelaySocket) -> Result<Datagram, SessionError> {
    loop {
        match sock.recv().await {
            Ok(datagram) => return Ok(datagram),
            Err(SocketError::PacketParse { src, reason }) => {
                log::warn!("Not relaying malformed datagram from {src}: {reason}");
            }
            Err(e) => return Err(e.into()),
        }
    }
}
