// The relay decision engine.
//
// RelayProcessor holds everything a session knows about one transfer and turns each received
// datagram into a ResultAction describing what the session should send and whether the transfer
// is over. It performs no I/O, so the session owns the socket and this module owns the rules:
//
// 1. The opening request goes to the server's well-known port.
// 2. The server's first reply reveals its TID, which is used from then on.
// 3. Every later packet is relayed to the opposite peer, with the configured fault applied once
//    along the way.
// 4. The transfer ends when the last two packets went through untouched and they close the
//    transfer: final DATA then its ACK for a read, final DATA (then the server's closing ACK) for
//    a write.

use crate::fault::{FaultMode, FaultPolicy, FaultSpec};
use crate::session::SessionError;
use crate::tftp::{Datagram, OpCode, Packet};
use std::net::SocketAddr;
use std::time::Duration;

/// How many relayed packets must pass untouched after a fault before termination is considered.
const COOLDOWN_PACKETS: u8 = 2;

/// A send the session should perform.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub bytes: Vec<u8>,
    pub dst: SocketAddr,
    /// When set, the send is handed to a delayed task instead of going out now.
    pub after: Option<Duration>,
}

impl Outgoing {
    fn now(bytes: Vec<u8>, dst: SocketAddr) -> Outgoing {
        Outgoing { bytes, dst, after: None }
    }

    fn delayed(self, wait: Duration) -> Outgoing {
        Outgoing { after: Some(wait), ..self }
    }
}

/// Represents an action that the session should take in response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Perform the sends and await the next packet.
    SendAndAwait(Vec<Outgoing>),

    /// Perform the sends, then the transfer is complete.
    TerminateWithPackets(Vec<Outgoing>),

    /// Nothing to send; keep waiting.
    RetryRecv,

    /// A peer gave up on the transfer. Close without relaying anything.
    CloseConnection(String),

    /// The opening request was dropped on purpose, so nothing will ever arrive on this socket.
    RequestDropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitServerReply,
    Relaying,
    Terminated,
}

#[derive(Debug)]
pub struct RelayProcessor {
    /// RRQ or WRQ, from the opening request.
    connection: OpCode,
    request: Datagram,
    client: SocketAddr,
    /// The server's well-known address, where requests are sent.
    server_listen: SocketAddr,
    /// The server's transfer address, learned from its replies.
    server: SocketAddr,
    phase: Phase,
    /// DATA/ACK pairs relayed so far, used to derive logical block indices.
    transfers: u32,
    cooldown: u8,
    tampered: bool,
    /// The packet received before the current one.
    previous: Option<Datagram>,
    /// The last packet forwarded, with its destination. Duplicates resend this.
    last_sent: Option<Outgoing>,
    /// Set once a duplicated request has gone to the server, whose answer arrives from a TID that
    /// belongs to no transfer this session relays.
    duplicate_request_sent: bool,
    stray_port: Option<u16>,
    /// Block of a write's final DATA, once relayed. The server's ACK of it closes the session.
    final_block: Option<u16>,
    policy: FaultPolicy,
}

impl RelayProcessor {
    pub fn new(request: Datagram, server_listen: SocketAddr, fault: FaultSpec) -> Result<RelayProcessor, SessionError> {
        let connection = request.opcode();
        if !connection.is_request() {
            return Err(SessionError::BadRequest(format!(
                "Only read and write requests can open a transfer, got {request}"
            )));
        }

        Ok(RelayProcessor {
            connection,
            client: request.src,
            request,
            server_listen,
            server: server_listen,
            phase: Phase::AwaitServerReply,
            transfers: 1,
            cooldown: 0,
            tampered: false,
            previous: None,
            last_sent: None,
            duplicate_request_sent: false,
            stray_port: None,
            final_block: None,
            policy: FaultPolicy::new(fault),
        })
    }

    pub fn connection(&self) -> OpCode {
        self.connection
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn transfers(&self) -> u32 {
        self.transfers
    }

    pub fn fault_armed(&self) -> bool {
        self.policy.is_armed()
    }

    /// What to do with the opening request.
    pub fn first_packet(&mut self) -> ResultAction {
        let out = Outgoing::now(self.request.bytes.clone(), self.server_listen);
        self.last_sent = Some(out.clone());

        if self.policy.fire_on_request(FaultMode::Lose, self.connection) {
            log::warn!("Dropped {} from client {}", self.request, self.client);
            self.phase = Phase::Terminated;
            return ResultAction::RequestDropped;
        }

        if self.policy.fire_on_request(FaultMode::Delay, self.connection) {
            log::info!("Delaying {} to server by {}ms", self.request, self.policy.delay().as_millis());
            return ResultAction::SendAndAwait(vec![out.delayed(self.policy.delay())]);
        }

        log::info!("Relaying {} to server {}", self.request, self.server_listen);
        ResultAction::SendAndAwait(vec![out])
    }

    /// Given an incoming packet, processes it and describes the action the session should take.
    pub fn process_packet(&mut self, datagram: Datagram) -> ResultAction {
        match self.phase {
            Phase::AwaitServerReply => self.process_first_reply(datagram),
            Phase::Relaying => self.process_relay(datagram),
            Phase::Terminated => {
                log::warn!("Ignoring {} from {}, the transfer is over", datagram, datagram.src);
                ResultAction::RetryRecv
            }
        }
    }

    fn process_first_reply(&mut self, datagram: Datagram) -> ResultAction {
        if datagram.src.port() == self.client.port() {
            log::warn!("Ignoring {} from the client before the server has answered", datagram);
            return ResultAction::RetryRecv;
        }

        self.server = datagram.src;
        self.phase = Phase::Relaying;
        // A read's first DATA completes the opening round trip; a write's ACK 0 does not.
        self.transfers = if self.connection == OpCode::Rrq { 2 } else { 1 };
        log::info!("Server answered from {}", self.server);

        let mut sends = Vec::new();
        if self.policy.fire_on_request(FaultMode::Duplicate, self.connection) {
            log::info!(
                "Duplicating {} to server {} in {}ms",
                self.request,
                self.server_listen,
                self.policy.delay().as_millis()
            );
            sends.push(Outgoing::now(self.request.bytes.clone(), self.server_listen).delayed(self.policy.delay()));
            self.duplicate_request_sent = true;
        }

        if let Packet::Error { code, message } = &datagram.packet {
            log::warn!("Server refused {}: {:?} '{}'", self.connection, code, message);
            sends.push(Outgoing::now(datagram.bytes.clone(), self.client));
            self.phase = Phase::Terminated;
            return ResultAction::TerminateWithPackets(sends);
        }

        let opcode = datagram.opcode();
        if self.policy.fire_on_first_reply(FaultMode::Lose, opcode, self.connection) {
            log::warn!("Dropped {} from server", datagram);
            self.previous = Some(datagram);
            return send_or_wait(sends);
        }

        let mut out = Outgoing::now(datagram.bytes.clone(), self.client);
        if self.policy.fire_on_first_reply(FaultMode::Delay, opcode, self.connection) {
            log::info!("Delaying {} to client by {}ms", datagram, self.policy.delay().as_millis());
            out = out.delayed(self.policy.delay());
        } else {
            log::info!("Relaying {} to client", datagram);
        }

        sends.push(out.clone());
        self.last_sent = Some(out);
        self.previous = Some(datagram);
        ResultAction::SendAndAwait(sends)
    }

    fn process_relay(&mut self, datagram: Datagram) -> ResultAction {
        let port = datagram.src.port();
        let from_client = port == self.client.port();

        if !from_client && port != self.server.port() && self.is_stray(port) {
            log::info!("Discarding {} from {}, it answers the duplicated request", datagram, datagram.src);
            return ResultAction::RetryRecv;
        }

        if let Packet::Error { code, message } = &datagram.packet {
            self.phase = Phase::Terminated;
            return ResultAction::CloseConnection(format!(
                "{} sent error packet: code: {:?}, message: '{}'",
                if from_client { "Client" } else { "Server" },
                code,
                message
            ));
        }

        self.tick_cooldown();

        let opcode = datagram.opcode();
        if self.policy.fire_on_packet(FaultMode::Lose, opcode, self.transfers) {
            log::warn!("Dropped {} from {}", datagram, if from_client { "client" } else { "server" });
            self.mark_tampered();
            self.previous = Some(datagram);
            return ResultAction::RetryRecv;
        }

        let (dst, recipient) = if from_client {
            (self.server, "server")
        } else {
            self.server = datagram.src;
            (self.client, "client")
        };

        let mut sends = Vec::new();
        if self.policy.fire_duplicate(opcode, self.transfers) {
            if let Some(last) = &self.last_sent {
                log::info!("Duplicating previous packet to {} in {}ms", last.dst, self.policy.delay().as_millis());
                sends.push(last.clone().delayed(self.policy.delay()));
            }
            self.mark_tampered();
        }

        let mut out = Outgoing::now(datagram.bytes.clone(), dst);
        if self.policy.fire_on_packet(FaultMode::Delay, opcode, self.transfers) {
            log::info!("Delaying {} to {} by {}ms", datagram, recipient, self.policy.delay().as_millis());
            out = out.delayed(self.policy.delay());
            self.mark_tampered();
        } else {
            log::info!("Relaying {} to {}", datagram, recipient);
        }
        sends.push(out.clone());
        self.last_sent = Some(out);

        let finished = self.closes_transfer(&datagram, from_client);
        self.previous = Some(datagram);

        if finished {
            log::info!("Transfer complete after {} round trips", self.transfers / 2);
            self.phase = Phase::Terminated;
            return ResultAction::TerminateWithPackets(sends);
        }

        self.transfers += 1;
        ResultAction::SendAndAwait(sends)
    }

    /// Decides whether relaying `current` ends the transfer.
    fn closes_transfer(&mut self, current: &Datagram, from_client: bool) -> bool {
        if let Some(block) = self.final_block {
            return !from_client && current.packet == Packet::Ack { block };
        }

        match self.connection {
            OpCode::Rrq => {
                if self.tampered {
                    return false;
                }
                let Some(previous) = &self.previous else {
                    return false;
                };
                previous.is_final_data() && current.opcode() == OpCode::Ack
            }
            _ => {
                // Armed even while tampered: a resent final DATA still ends the write.
                if from_client && current.is_final_data() {
                    log::info!("Final block of the write relayed, waiting for the server's last ACK");
                    self.final_block = current.packet.block();
                }
                false
            }
        }
    }

    fn is_stray(&mut self, port: u16) -> bool {
        match self.stray_port {
            Some(stray) => stray == port,
            None if self.duplicate_request_sent => {
                self.stray_port = Some(port);
                true
            }
            None => false,
        }
    }

    fn tick_cooldown(&mut self) {
        if self.cooldown > 0 {
            self.cooldown -= 1;
            if self.cooldown == 0 {
                self.tampered = false;
            }
        }
    }

    fn mark_tampered(&mut self) {
        self.tampered = true;
        self.cooldown = COOLDOWN_PACKETS;
    }
}

fn send_or_wait(sends: Vec<Outgoing>) -> ResultAction {
    if sends.is_empty() {
        ResultAction::RetryRecv
    } else {
        ResultAction::SendAndAwait(sends)
    }
}
