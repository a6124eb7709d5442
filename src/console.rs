// Operator console.
//
// Reads one command per line from stdin and publishes the resulting fault configuration. Only
// sessions started afterwards see a change; a malformed command leaves the board untouched.
//
//   normal
//   duplicate <RRQ|WRQ> <delayMs>         duplicate <DATA|ACK> <block> <delayMs>
//   lose <RRQ|WRQ>                        lose <DATA|ACK> <block>
//   delay <RRQ|WRQ> <delayMs>             delay <DATA|ACK> <block> <delayMs>
//   help [command]
//   quit

use crate::config::FaultBoard;
use crate::fault::{FaultSpec, Target};
use std::io::Write;
use std::ops::ControlFlow;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("unknown packet type '{0}', expected RRQ, WRQ, DATA or ACK")]
    UnknownPacketType(String),

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid {what} '{value}'")]
    InvalidNumber { what: &'static str, value: String },

    #[error("block number must be at least 1")]
    ZeroBlock,

    #[error("unexpected argument '{0}'")]
    Unexpected(String),

    #[error("no help for '{0}'")]
    UnknownTopic(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelpTopic {
    Normal,
    Duplicate,
    Lose,
    Delay,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Normal,
    Inject(FaultSpec),
    Help(Option<HelpTopic>),
    Quit,
}

/// How the console stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Quit,
    InputClosed,
}

fn parse_number<'a>(words: &mut impl Iterator<Item = &'a str>, what: &'static str) -> Result<u64, CommandError> {
    let word = words.next().ok_or(CommandError::Missing(what))?;
    word.parse()
        .map_err(|_| CommandError::InvalidNumber { what, value: word.to_string() })
}

fn parse_block<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<u32, CommandError> {
    let word = words.next().ok_or(CommandError::Missing("block number"))?;
    match word.parse::<u32>() {
        Ok(0) => Err(CommandError::ZeroBlock),
        Ok(block) => Ok(block),
        Err(_) => Err(CommandError::InvalidNumber { what: "block number", value: word.to_string() }),
    }
}

/// RRQ and WRQ take no block number.
fn parse_target<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<Target, CommandError> {
    let word = words.next().ok_or(CommandError::Missing("packet type"))?;
    match word.to_lowercase().as_str() {
        "rrq" => Ok(Target::Rrq),
        "wrq" => Ok(Target::Wrq),
        "data" => Ok(Target::Data(parse_block(words)?)),
        "ack" => Ok(Target::Ack(parse_block(words)?)),
        _ => Err(CommandError::UnknownPacketType(word.to_string())),
    }
}

fn parse_delay<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<Duration, CommandError> {
    parse_number(words, "delay in milliseconds").map(Duration::from_millis)
}

fn parse_topic(word: &str) -> Result<HelpTopic, CommandError> {
    match word.to_lowercase().as_str() {
        "normal" => Ok(HelpTopic::Normal),
        "duplicate" => Ok(HelpTopic::Duplicate),
        "lose" => Ok(HelpTopic::Lose),
        "delay" => Ok(HelpTopic::Delay),
        "quit" => Ok(HelpTopic::Quit),
        _ => Err(CommandError::UnknownTopic(word.to_string())),
    }
}

impl Command {
    /// Parses one console line. Keywords and packet types are case-insensitive.
    pub fn parse(line: &str) -> Result<Command, CommandError> {
        let mut words = line.split_whitespace();
        let keyword = words.next().ok_or(CommandError::Empty)?;

        let command = match keyword.to_lowercase().as_str() {
            "normal" => Command::Normal,
            "duplicate" => {
                let target = parse_target(&mut words)?;
                Command::Inject(FaultSpec::Duplicate { target, delay: parse_delay(&mut words)? })
            }
            "lose" => Command::Inject(FaultSpec::Lose { target: parse_target(&mut words)? }),
            "delay" => {
                let target = parse_target(&mut words)?;
                Command::Inject(FaultSpec::Delay { target, delay: parse_delay(&mut words)? })
            }
            "help" => Command::Help(words.next().map(parse_topic).transpose()?),
            "quit" => Command::Quit,
            _ => return Err(CommandError::UnknownCommand(keyword.to_string())),
        };

        match words.next() {
            Some(extra) => Err(CommandError::Unexpected(extra.to_string())),
            None => Ok(command),
        }
    }
}

const MENU: &str = "
type 'normal' to relay without faults (default)
type 'duplicate' with a packet type, block number (DATA/ACK only) and delay in ms to send a packet twice
type 'lose' with a packet type and block number (DATA/ACK only) to drop a packet
type 'delay' with a packet type, block number (DATA/ACK only) and delay in ms to hold a packet back
type 'quit' to stop the relay; no further transfers will go through
type 'help' to show this menu, or 'help <command>' for details on one command
";

fn help_text(topic: HelpTopic) -> &'static str {
    match topic {
        HelpTopic::Normal => {
            "Format: normal\n\
             Relay every packet untouched. This is the default."
        }
        HelpTopic::Duplicate => {
            "Format for RRQ/WRQ: duplicate <packet type> <ms until the copy is sent>\n\
             Format for DATA/ACK: duplicate <packet type> <block number> <ms until the copy is sent>\n\
             Sends the chosen packet a second time after the given delay.\n\
             e.g. 'duplicate rrq 500' sends the read request to the server again half a second later\n\
             e.g. 'duplicate data 15 1500' resends data block 15 after 1.5 seconds"
        }
        HelpTopic::Lose => {
            "Format for RRQ/WRQ: lose <packet type>\n\
             Format for DATA/ACK: lose <packet type> <block number>\n\
             Drops the chosen packet once.\n\
             e.g. 'lose wrq' drops the next write request\n\
             e.g. 'lose data 10' drops the first data block 10"
        }
        HelpTopic::Delay => {
            "Format for RRQ/WRQ: delay <packet type> <ms to hold the packet>\n\
             Format for DATA/ACK: delay <packet type> <block number> <ms to hold the packet>\n\
             Holds the chosen packet back before relaying it.\n\
             e.g. 'delay rrq 1000' delivers the read request one second late\n\
             e.g. 'delay ack 3 200' delivers the acknowledgement of block 3 200ms late"
        }
        HelpTopic::Quit => {
            "Format: quit\n\
             Stops the relay at once. Transfers in progress are abandoned and no new ones can start."
        }
    }
}

/// The operator's side of the fault board.
pub struct Console {
    board: FaultBoard,
}

impl Console {
    pub fn new(board: FaultBoard) -> Console {
        Console { board }
    }

    /// Applies a command, returning the text to show the operator, or `Break` on quit.
    pub fn execute(&self, command: Command) -> ControlFlow<(), String> {
        match command {
            Command::Normal => {
                self.board.publish(FaultSpec::Normal);
                ControlFlow::Continue("Relay set to normal operation".to_string())
            }
            Command::Inject(spec) => {
                self.board.publish(spec);
                ControlFlow::Continue(format!("New transfers will {spec}"))
            }
            Command::Help(None) => ControlFlow::Continue(MENU.to_string()),
            Command::Help(Some(topic)) => ControlFlow::Continue(help_text(topic).to_string()),
            Command::Quit => ControlFlow::Break(()),
        }
    }

    /// Reads commands from stdin until `quit` or end of input.
    pub async fn run(&self) -> std::io::Result<Shutdown> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("{MENU}");

        loop {
            print!("command: ");
            std::io::stdout().flush()?;

            let Some(line) = lines.next_line().await? else {
                return Ok(Shutdown::InputClosed);
            };
            if line.trim().is_empty() {
                continue;
            }

            match Command::parse(&line) {
                Ok(command) => match self.execute(command) {
                    ControlFlow::Continue(reply) => println!("{reply}"),
                    ControlFlow::Break(()) => return Ok(Shutdown::Quit),
                },
                Err(e) => println!("invalid command: {e}"),
            }
        }
    }
}
