use crate::fault::FaultSpec;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Command line options.
#[derive(Parser, Debug)]
#[command(name = "tftp-errsim", version, about = "TFTP relay that injects one lost, duplicated or delayed packet per transfer")]
pub struct Args {
    /// Address the relay accepts read and write requests on
    #[arg(long, default_value = "0.0.0.0:69")]
    pub listen: SocketAddr,

    /// Host of the TFTP server, resolved for every new transfer
    #[arg(long, default_value = "localhost")]
    pub server_host: String,

    /// Well-known port of the TFTP server
    #[arg(long, default_value_t = 69)]
    pub server_port: u16,

    /// Fault to start with, in console syntax (e.g. "lose data 3")
    #[arg(long)]
    pub fault: Option<String>,
}

/// Where sessions send requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub server_host: String,
    pub server_port: u16,
}

impl From<&Args> for RelayConfig {
    fn from(args: &Args) -> Self {
        RelayConfig { server_host: args.server_host.clone(), server_port: args.server_port }
    }
}

/// The fault configuration in force, tagged with the generation that published it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultSnapshot {
    pub generation: u64,
    pub spec: FaultSpec,
}

/// The process-wide fault configuration.
///
/// The console publishes whole new snapshots and the listener copies the current one into each
/// session it starts. Sessions already running keep the copy they were given.
#[derive(Clone)]
pub struct FaultBoard {
    tx: Arc<watch::Sender<FaultSnapshot>>,
}

impl FaultBoard {
    pub fn new(spec: FaultSpec) -> FaultBoard {
        let (tx, _) = watch::channel(FaultSnapshot { generation: 0, spec });
        FaultBoard { tx: Arc::new(tx) }
    }

    /// Replaces the configuration for sessions started from now on.
    pub fn publish(&self, spec: FaultSpec) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|current| {
            current.generation += 1;
            current.spec = spec;
            generation = current.generation;
        });
        log::info!("Fault configuration {generation}: {spec}");
        generation
    }

    pub fn snapshot(&self) -> FaultSnapshot {
        *self.tx.borrow()
    }

    /// Resets to normal operation, but only if `generation` is still the one in force.
    ///
    /// A `lose RRQ`/`lose WRQ` would otherwise eat every retransmission of the request, since each
    /// one starts a new session with the same snapshot.
    pub fn retire(&self, generation: u64) -> bool {
        let retired = self.tx.send_if_modified(|current| {
            if current.generation != generation || current.spec == FaultSpec::Normal {
                return false;
            }
            current.generation += 1;
            current.spec = FaultSpec::Normal;
            true
        });
        if retired {
            log::info!("Fault configuration {generation} has fired, back to normal operation");
        }
        retired
    }
}
