use async_io::Async;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use thiserror::Error;

/// Largest payload a DATA packet may carry. Anything shorter ends the transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Largest TFTP packet on the wire: 2 bytes opcode, 2 bytes block, then the data.
pub const MAX_PACKET_SIZE: usize = DATA_BUFFER_SIZE + 4;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the relay socket
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Socket IO error: {0}")]
    IO(#[from] io::Error),

    #[error("Packet parsing error from {src}: {reason}")]
    PacketParse { src: SocketAddr, reason: String },
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode { NetAscii, Octet, Mail }

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode { Undefined, FileNotFound, AccessViolation, DiskFull, Illegal, UnknownTid, FileAlreadyExists, NoSuchUser }

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        match code {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

/// The five TFTP opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error }

impl OpCode {
    fn from_raw(raw: u16) -> Option<OpCode> {
        match raw {
            1 => Some(OpCode::Rrq),
            2 => Some(OpCode::Wrq),
            3 => Some(OpCode::Data),
            4 => Some(OpCode::Ack),
            5 => Some(OpCode::Error),
            _ => None,
        }
    }

    fn raw(self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }

    /// True for the two packet types that open a transfer.
    pub fn is_request(self) -> bool {
        matches!(self, OpCode::Rrq | OpCode::Wrq)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OpCode::Rrq => "RRQ",
            OpCode::Wrq => "WRQ",
            OpCode::Data => "DATA",
            OpCode::Ack => "ACK",
            OpCode::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|&c| c == 0x00).unwrap_or(buf.len());
    (buf[..end].iter().map(|&c| char::from(c)).collect(), end)
}

fn parse_path_and_mode(buf: &[u8]) -> Result<(String, FileMode), String> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err("Request does not contain a mode, but it needs to!".to_string());
    }

    let (raw_mode, mode_end) = string_from_buffer(&buf[path_end + 1..]);

    if path_end + 1 + mode_end >= buf.len() {
        return Err("Mode must be terminated with a null byte!".to_string());
    }

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        "mail" => FileMode::Mail,
        _ => return Err(format!("Unknown file mode: '{raw_mode}'")),
    };

    Ok((path, mode))
}

impl Packet {
    /// Parses a packet, validating it once so nothing downstream indexes raw bytes.
    pub fn parse_from_buf(buf: &[u8]) -> Result<Packet, String> {
        if buf.len() < 4 {
            return Err(format!("Packet too short! ({} bytes)", buf.len()));
        }

        let raw = u16_from_buffer(&buf[..2]);
        let opcode = OpCode::from_raw(raw).ok_or_else(|| format!("Unknown opcode retrieved: {raw}"))?;

        match opcode {
            OpCode::Rrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode })
            }
            OpCode::Wrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode })
            }
            OpCode::Data => {
                if buf.len() > MAX_PACKET_SIZE {
                    return Err(format!("Data packet of {} bytes exceeds {MAX_PACKET_SIZE}", buf.len()));
                }
                Ok(Packet::Data { block: u16_from_buffer(&buf[2..4]), data: Vec::from(&buf[4..]) })
            }
            OpCode::Ack => Ok(Packet::Ack { block: u16_from_buffer(&buf[2..4]) }),
            OpCode::Error => {
                let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
                let (message, _) = string_from_buffer(&buf[4..]);
                Ok(Packet::Error { code, message })
            }
        }
    }

    /// Serializes the packet into its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.opcode().raw().to_be_bytes().to_vec();
        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                buf.extend_from_slice(path.as_bytes());
                buf.push(0x00);
                let mode = match mode {
                    FileMode::NetAscii => "netascii",
                    FileMode::Octet => "octet",
                    FileMode::Mail => "mail",
                };
                buf.extend_from_slice(mode.as_bytes());
                buf.push(0x00);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                buf.extend_from_slice(&u16::from(*code).to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
            }
        }
        buf
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// The block number, for the packet types that carry one.
    pub fn block(&self) -> Option<u16> {
        match self {
            Packet::Data { block, .. } | Packet::Ack { block } => Some(*block),
            _ => None,
        }
    }
}

/// A packet as it arrived at the relay: the parsed view, the exact bytes to forward, and the
/// peer that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub packet: Packet,
    pub bytes: Vec<u8>,
    pub src: SocketAddr,
}

impl Datagram {
    pub fn parse(bytes: &[u8], src: SocketAddr) -> TftpResult<Datagram> {
        match Packet::parse_from_buf(bytes) {
            Ok(packet) => Ok(Datagram { packet, bytes: bytes.to_vec(), src }),
            Err(reason) => Err(SocketError::PacketParse { src, reason }),
        }
    }

    pub fn opcode(&self) -> OpCode {
        self.packet.opcode()
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    /// A DATA packet shorter than the maximum marks the end of the file.
    pub fn is_final_data(&self) -> bool {
        self.opcode() == OpCode::Data && self.len() < MAX_PACKET_SIZE
    }
}

impl fmt::Display for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.packet {
            Packet::Error { code, message } => write!(f, "ERROR {code:?} '{message}'"),
            packet => match packet.block() {
                Some(block) => write!(f, "{} #{block} ({} bytes)", packet.opcode(), self.len()),
                None => write!(f, "{} ({} bytes)", packet.opcode(), self.len()),
            },
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers on receipt and relays raw bytes on send.
///
/// Cloning is cheap and every clone refers to the same socket, which is how delayed sends share
/// the session's socket with the relay loop.
#[derive(Clone)]
pub struct RelaySocket {
    sock: Arc<Async<UdpSocket>>,
}

impl RelaySocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<RelaySocket> {
        Ok(RelaySocket {
            sock: Arc::new(Async::<UdpSocket>::bind(addr)?),
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Waits, without any timeout, for the next datagram.
    pub async fn recv(&self) -> TftpResult<Datagram> {
        // One spare byte so an oversized datagram is seen as such instead of truncated.
        let mut buf = [0; MAX_PACKET_SIZE + 1];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;
        Datagram::parse(&buf[..total_written], src)
    }

    pub async fn send_to(&self, bytes: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(bytes, dst).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio_test::{assert_err, assert_ok};

    fn peer() -> SocketAddr {
        (Ipv4Addr::LOCALHOST, 40000).into()
    }

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: mail
            0x6D, 0x61, 0x69, 0x6C, 0x00];

        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(packet, Packet::ReadReq { path: "/path/to/data.txt".to_string(), mode: FileMode::Mail });
        assert_eq!(packet.opcode(), OpCode::Rrq);
        assert_eq!(packet.block(), None);
    }

    #[test]
    fn test_packet_write_req_mixed_case_mode() {
        let mut buf = vec![0x00, 0x02];
        buf.extend_from_slice(b"file.bin\0OcTeT\0");

        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(packet, Packet::WriteReq { path: "file.bin".to_string(), mode: FileMode::Octet });
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03,
            // block number
            0x12, 0x34,
            // data
            0xDE, 0xAD, 0xBE, 0xEF];

        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(packet, Packet::Data { block: 0x1234, data: vec![0xDE, 0xAD, 0xBE, 0xEF] });
        assert_eq!(packet.block(), Some(0x1234));
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(packet, Packet::Ack { block: 0x102f });
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05,
            // Error code
            0x00, 0x04,
            // Error message: Illegal!
            0x49, 0x6C, 0x6C, 0x65, 0x67, 0x61, 0x6C, 0x21];

        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(packet, Packet::Error { code: ErrorCode::Illegal, message: "Illegal!".to_string() });
    }

    #[test]
    fn test_packet_parse_failures() {
        // Invalid opcodes
        assert_err!(Packet::parse_from_buf(&[0x10]));
        assert_err!(Packet::parse_from_buf(&[0x10, 0x00]));
        assert_err!(Packet::parse_from_buf(&[0x00, 0x09, 0x00, 0x00]));
        // Invalid read path
        assert_err!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69]));
        // Missing mode string
        assert_err!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00]));
        // Mode string without its terminating null byte
        assert_err!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x6D, 0x61, 0x69, 0x6C]));
        // Invalid mode string
        assert_err!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x62, 0x61, 0x64, 0x00]));
        // Oversized data
        let mut oversized = vec![0x00, 0x03, 0x00, 0x01];
        oversized.extend_from_slice(&[0xAA; 513]);
        assert_err!(Packet::parse_from_buf(&oversized));
    }

    #[test]
    fn test_packet_to_bytes_matches_wire_format() {
        assert_eq!(Packet::Ack { block: 0x0102 }.to_bytes(), vec![0x00, 0x04, 0x01, 0x02]);
        assert_eq!(
            Packet::ReadReq { path: "a".to_string(), mode: FileMode::NetAscii }.to_bytes(),
            b"\x00\x01a\x00netascii\x00".to_vec()
        );
        assert_eq!(
            Packet::Error { code: ErrorCode::UnknownTid, message: "who?".to_string() }.to_bytes(),
            b"\x00\x05\x00\x05who?\x00".to_vec()
        );
    }

    #[test]
    fn test_datagram_keeps_raw_bytes_and_source() {
        let mut buf = vec![0x00, 0x03, 0x00, 0x02];
        buf.extend_from_slice(&[0x78; 488]);

        let datagram = assert_ok!(Datagram::parse(&buf, peer()));
        assert_eq!(datagram.bytes, buf);
        assert_eq!(datagram.src, peer());
        assert_eq!(datagram.len(), 492);
        assert!(datagram.is_final_data());
        assert_eq!(datagram.to_string(), "DATA #2 (492 bytes)");
    }

    #[test]
    fn test_full_data_block_is_not_final() {
        let datagram = assert_ok!(Datagram::parse(
            &Packet::Data { block: 1, data: vec![0x78; DATA_BUFFER_SIZE] }.to_bytes(),
            peer()
        ));
        assert_eq!(datagram.len(), MAX_PACKET_SIZE);
        assert!(!datagram.is_final_data());
    }

    #[test]
    fn test_datagram_parse_error_names_sender() {
        match Datagram::parse(&[0x00, 0x07, 0x00, 0x00], peer()) {
            Err(SocketError::PacketParse { src, .. }) => assert_eq!(src, peer()),
            other => panic!("Expected a parse error, got {:#?}", other),
        }
    }

    #[tokio::test]
    async fn test_relay_socket_round_trip() {
        let a = assert_ok!(RelaySocket::bind((Ipv4Addr::LOCALHOST, 0).into()));
        let b = assert_ok!(RelaySocket::bind((Ipv4Addr::LOCALHOST, 0).into()));
        let b_addr = assert_ok!(b.local_addr());

        let ack = Packet::Ack { block: 7 }.to_bytes();
        assert_ok!(a.send_to(&ack, b_addr).await);

        let datagram = assert_ok!(b.recv().await);
        assert_eq!(datagram.packet, Packet::Ack { block: 7 });
        assert_eq!(datagram.src, assert_ok!(a.local_addr()));
    }

    #[tokio::test]
    async fn test_relay_socket_rejects_oversized_data() {
        let a = assert_ok!(RelaySocket::bind((Ipv4Addr::LOCALHOST, 0).into()));
        let b = assert_ok!(RelaySocket::bind((Ipv4Addr::LOCALHOST, 0).into()));
        let b_addr = assert_ok!(b.local_addr());

        let oversized = Packet::Data { block: 1, data: vec![0x41; DATA_BUFFER_SIZE + 80] }.to_bytes();
        assert_ok!(a.send_to(&oversized, b_addr).await);

        match b.recv().await {
            Err(SocketError::PacketParse { src, reason }) => {
                assert_eq!(src, assert_ok!(a.local_addr()));
                assert!(reason.contains("exceeds"));
            }
            other => panic!("Expected the oversized block to be rejected, got {:#?}", other),
        }

        // A full block still fits.
        let full = Packet::Data { block: 2, data: vec![0x41; DATA_BUFFER_SIZE] }.to_bytes();
        assert_ok!(a.send_to(&full, b_addr).await);
        assert_eq!(assert_ok!(b.recv().await).len(), MAX_PACKET_SIZE);
    }
}
