use crate::config::{FaultBoard, RelayConfig};
use crate::session::{resolve_server, RelaySession, SessionOutcome};
use crate::tftp::{Datagram, ErrorCode, Packet, RelaySocket, SocketError, TftpResult};
use std::net::SocketAddr;
use std::sync::Arc;

/// Accepts opening requests and starts a relay session for each one.
pub struct Listener {
    sock: RelaySocket,
    config: Arc<RelayConfig>,
    board: FaultBoard,
}

impl Listener {
    pub fn bind(addr: SocketAddr, config: RelayConfig, board: FaultBoard) -> TftpResult<Listener> {
        let listener = Listener { sock: RelaySocket::bind(addr)?, config: Arc::new(config), board };
        log::info!("Listening for requests on {}", listener.local_addr()?);
        Ok(listener)
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    /// Serves requests forever. Receive failures are logged and do not stop the listener.
    pub async fn run(self) {
        loop {
            match self.sock.recv().await {
                Ok(datagram) if datagram.opcode().is_request() => self.spawn_session(datagram),
                Ok(datagram) => {
                    log::warn!("Got {} from {} on the request port", datagram, datagram.src);
                    // Sent as a courtesy; the peer is talking to the wrong TID.
                    let error = Packet::Error {
                        code: ErrorCode::UnknownTid,
                        message: "Only read and write requests are accepted on this port".to_string(),
                    };
                    if let Err(e) = self.sock.send_to(&error.to_bytes(), datagram.src).await {
                        log::warn!("Unable to send error packet to {}: {e}", datagram.src);
                    }
                }
                Err(SocketError::PacketParse { src, reason }) => {
                    log::warn!("Ignoring malformed request from {src}: {reason}");
                }
                Err(e) => log::error!("Listener receive failed: {e}"),
            }
        }
    }

    fn spawn_session(&self, request: Datagram) {
        let snapshot = self.board.snapshot();
        let config = self.config.clone();
        let board = self.board.clone();
        let client = request.src;
        log::info!("Received {} from {}", request, client);

        tokio::spawn(async move {
            let outcome = async {
                let server = resolve_server(&config.server_host, config.server_port).await?;
                let mut session = RelaySession::new(request, server, snapshot.spec)?;
                session.run().await
            }
            .await;

            match outcome {
                Ok(SessionOutcome::Completed) => log::info!("Transfer for {client} complete"),
                Ok(SessionOutcome::PeerError(_)) => log::info!("Transfer for {client} ended by an error packet"),
                Ok(SessionOutcome::RequestDropped) => {
                    board.retire(snapshot.generation);
                }
                Err(e) => log::error!("Transfer for {client} failed: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultSpec, Target};
    use crate::tftp::FileMode;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    const WAIT: Duration = Duration::from_secs(5);

    async fn recv(sock: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0; 600];
        let (len, src) = assert_ok!(assert_ok!(timeout(WAIT, sock.recv_from(&mut buf)).await));
        (assert_ok!(Packet::parse_from_buf(&buf[..len])), src)
    }

    async fn setup(fault: FaultSpec) -> (SocketAddr, UdpSocket, UdpSocket, FaultBoard) {
        let server = assert_ok!(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await);
        let client = assert_ok!(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await);
        let config = RelayConfig {
            server_host: "127.0.0.1".to_string(),
            server_port: assert_ok!(server.local_addr()).port(),
        };
        let board = FaultBoard::new(fault);
        let listener = assert_ok!(Listener::bind((Ipv4Addr::LOCALHOST, 0).into(), config, board.clone()));
        let addr = assert_ok!(listener.local_addr());
        tokio::spawn(listener.run());
        (addr, client, server, board)
    }

    fn read_request() -> Vec<u8> {
        Packet::ReadReq { path: "boot.img".to_string(), mode: FileMode::Octet }.to_bytes()
    }

    #[tokio::test]
    async fn test_request_starts_a_relay_session() {
        let (listen, client, server, _board) = setup(FaultSpec::Normal).await;
        assert_ok!(client.send_to(&read_request(), listen).await);

        let (request, relay) = recv(&server).await;
        assert_eq!(request, Packet::ReadReq { path: "boot.img".to_string(), mode: FileMode::Octet });
        assert_ne!(relay.port(), listen.port());

        let data = Packet::Data { block: 1, data: b"tiny".to_vec() };
        assert_ok!(server.send_to(&data.to_bytes(), relay).await);
        let (received, client_relay) = recv(&client).await;
        assert_eq!(received, data);
        assert_eq!(client_relay, relay);

        assert_ok!(client.send_to(&Packet::Ack { block: 1 }.to_bytes(), client_relay).await);
        assert_eq!(recv(&server).await.0, Packet::Ack { block: 1 });
    }

    #[tokio::test]
    async fn test_stray_packet_gets_error_reply() {
        let (listen, client, _server, _board) = setup(FaultSpec::Normal).await;
        assert_ok!(client.send_to(&Packet::Ack { block: 3 }.to_bytes(), listen).await);

        match recv(&client).await.0 {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownTid),
            other => panic!("Expected an error packet, got {:#?}", other),
        }
    }

    #[tokio::test]
    async fn test_lost_request_is_retired_so_retry_succeeds() {
        let (listen, client, server, board) = setup(FaultSpec::Lose { target: Target::Rrq }).await;
        assert_ok!(client.send_to(&read_request(), listen).await);

        let mut buf = [0; 600];
        assert!(timeout(Duration::from_millis(300), server.recv_from(&mut buf)).await.is_err());
        assert_eq!(board.snapshot().spec, FaultSpec::Normal);

        // The client's retransmission starts a fresh session with normal operation.
        assert_ok!(client.send_to(&read_request(), listen).await);
        let (request, _) = recv(&server).await;
        assert!(matches!(request, Packet::ReadReq { .. }));
    }
}
