use crate::tftp::RelaySocket;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinSet;

/// Sends scheduled to go out later on a session's socket.
///
/// Each send is its own task, so the relay loop never waits on one. The set is owned by the
/// session: `drain` lets a finishing session flush what is still pending, and dropping the set
/// aborts whatever was left.
pub struct DelayedSends {
    sock: RelaySocket,
    pending: JoinSet<()>,
}

impl DelayedSends {
    pub fn new(sock: RelaySocket) -> DelayedSends {
        DelayedSends { sock, pending: JoinSet::new() }
    }

    /// Sends `bytes` to `dst` once `wait` has elapsed.
    pub fn schedule(&mut self, bytes: Vec<u8>, dst: SocketAddr, wait: Duration) {
        let sock = self.sock.clone();
        log::info!("Scheduling {} bytes to {} in {}ms", bytes.len(), dst, wait.as_millis());
        self.pending.spawn(async move {
            tokio::time::sleep(wait).await;
            match sock.send_to(&bytes, dst).await {
                Ok(()) => log::info!("Delayed send of {} bytes to {} went out", bytes.len(), dst),
                Err(e) => log::warn!("Delayed send to {} failed: {e}", dst),
            }
        });
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Waits for every scheduled send to go out.
    pub async fn drain(&mut self) {
        if !self.pending.is_empty() {
            log::info!("Waiting on {} delayed send(s)", self.pending.len());
        }
        while let Some(res) = self.pending.join_next().await {
            if let Err(e) = res {
                log::warn!("Delayed send task ended abnormally: {e}");
            }
        }
    }
}
