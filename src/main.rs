// This is a TFTP error simulator: a UDP relay that sits between a TFTP client and a TFTP server
// (RFC 1350) and can spoil one packet of each transfer on purpose.
//
// The client sends its RRQ or WRQ to the relay instead of the server. For every such request the
// relay opens a session on a fresh ephemeral port, forwards the request to the server's
// well-known port, and from then on passes DATA and ACK packets back and forth. Both peers only
// ever see the relay's session port as the other side's TID.
//
// -------------------------------
// Faults
//
// The operator picks at most one fault at a time on the console:
//
// - duplicate: a chosen packet reaches its recipient twice, the copy after a delay
// - lose:      a chosen packet is never relayed
// - delay:     a chosen packet is held back for a while before being relayed
//
// A fault names a packet type (RRQ, WRQ, DATA, ACK) and, for DATA and ACK, a block number. Each
// session takes a copy of the configuration when it starts and fires its fault at most once.
// Changing the configuration only affects transfers that start afterwards.
//
// -------------------------------
// Termination
//
// A read ends when the final DATA (shorter than 512 bytes of payload) has been acknowledged. A
// write ends when the final DATA and the server's ACK of it have gone through. A read is only
// considered finished when the last two packets were relayed untouched, so a tampered exchange
// keeps its session open while the peers recover. An ERROR packet from either peer ends the
// session.
//
// -------------------------------
// Limitations
//
// Receives have no timeout: a session whose peers both went quiet waits forever. 'quit' exits the
// process immediately and abandons transfers in flight.

pub mod config;
pub mod console;
pub mod delayed;
pub mod fault;
pub mod listener;
pub mod processor;
pub mod session;
pub mod tftp;

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::{Args, FaultBoard, RelayConfig};
use console::{Command, Console, Shutdown};
use fault::FaultSpec;
use listener::Listener;

fn initial_fault(args: &Args) -> Result<FaultSpec> {
    let Some(line) = &args.fault else {
        return Ok(FaultSpec::Normal);
    };
    match Command::parse(line).with_context(|| format!("Invalid --fault '{line}'"))? {
        Command::Normal => Ok(FaultSpec::Normal),
        Command::Inject(spec) => Ok(spec),
        _ => bail!("--fault takes normal, duplicate, lose or delay, got '{line}'"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let board = FaultBoard::new(initial_fault(&args)?);
    let listener = Listener::bind(args.listen, RelayConfig::from(&args), board.clone())
        .with_context(|| format!("Unable to listen on {}", args.listen))?;
    log::info!("Relaying to {}:{} with {}", args.server_host, args.server_port, board.snapshot().spec);

    let relay = tokio::spawn(listener.run());

    match Console::new(board).run().await? {
        Shutdown::Quit => {
            println!("Error simulator shutting down on 'quit'.");
            std::process::exit(0);
        }
        Shutdown::InputClosed => {
            log::info!("Console input closed, relaying until interrupted");
            relay.await.context("Listener task failed")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::Target;

    #[test]
    fn test_initial_fault_from_flag() {
        let args = Args::parse_from(["tftp-errsim", "--fault", "lose DATA 3"]);
        assert_eq!(initial_fault(&args).ok(), Some(FaultSpec::Lose { target: Target::Data(3) }));

        let args = Args::parse_from(["tftp-errsim"]);
        assert_eq!(initial_fault(&args).ok(), Some(FaultSpec::Normal));
    }

    #[test]
    fn test_initial_fault_rejects_other_commands() {
        assert!(initial_fault(&Args::parse_from(["tftp-errsim", "--fault", "quit"])).is_err());
        assert!(initial_fault(&Args::parse_from(["tftp-errsim", "--fault", "lose data 0"])).is_err());
    }
}
