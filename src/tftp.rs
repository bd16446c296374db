use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest payload carried by one Data packet. A shorter payload ends the transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Largest datagram either peer sends. Error packets are always exactly this long.
pub const MAX_PACKET_SIZE: usize = 516;

/// The only transfer mode spoken on the wire. Matched case-sensitively.
pub const MODE: &str = "octet";

/// Opcode plus block number (or opcode plus error code).
const HEADER_SIZE: usize = 4;

/// Opcode, filename NUL, mode and mode NUL have to fit next to the filename.
pub const MAX_FILENAME_LEN: usize = MAX_PACKET_SIZE - 2 - 1 - MODE.len() - 1;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    /// A datagram arrived but could not be parsed. Carries the sender so the caller can decide
    /// whether it came from its peer at all.
    Malformed { src: SocketAddr, reason: String },
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {}", e),
            SocketError::Malformed { src, reason } => write!(f, "Malformed packet from {}: {}", src, reason),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

fn parse_error<T>(msg: &str) -> TftpResult<T> {
    Err(SocketError::PacketParse(msg.to_string()))
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode { Undefined, FileNotFound, AccessViolation, DiskFull, Illegal, UnknownTid, FileAlreadyExists, NoSuchUser }

impl ErrorCode {
    pub fn code(&self) -> u16 {
        match self {
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

    /// Unknown codes collapse to `Undefined`.
    pub fn from_code(raw: u16) -> ErrorCode {
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

    /// Human readable text sent in the message field of an Error packet.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::Undefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::Illegal => "Illegal TFTP operation",
            ErrorCode::UnknownTid => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

/// The opcode in the first two bytes of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error }

impl OpCode {
    pub fn code(&self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,
    },

    /// A write request packet
    WriteReq {
        path: String,
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
    u16::from_le_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and runs until the
/// first 0 byte.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|&b| b == 0x00).unwrap_or(buf.len());
    (String::from_utf8_lossy(&buf[..end]).into_owned(), end)
}

/// Reads the raw opcode of a datagram without judging whether it is a known one.
pub fn decode_opcode(buf: &[u8]) -> TftpResult<u16> {
    if buf.len() < 2 {
        return parse_error("Packet too short to carry an opcode!");
    }
    Ok(u16_from_buffer(&buf[..2]))
}

/// Reads the block number of a Data or Ack packet.
pub fn decode_block_num(buf: &[u8]) -> TftpResult<u16> {
    if buf.len() < HEADER_SIZE {
        return parse_error("Packet too short to carry a block number!");
    }
    Ok(u16_from_buffer(&buf[2..4]))
}

/// Reads the filename of a request.
///
/// The field is bounded by scanning for the first occurrence of the mode literal, so a filename
/// that itself contains `octet` cannot be decoded. Such requests are rejected rather than
/// mis-split: the byte before the literal has to be the filename's terminating NUL.
pub fn decode_filename(buf: &[u8]) -> TftpResult<String> {
    let body = match buf.get(2..) {
        Some(body) => body,
        None => return parse_error("Request too short to carry a filename!"),
    };

    let mode_at = match body.windows(MODE.len()).position(|w| w == MODE.as_bytes()) {
        Some(pos) => pos,
        None => return parse_error("Request does not carry the octet mode, but it needs to!"),
    };

    if mode_at == 0 || body[mode_at - 1] != 0x00 {
        return parse_error("Filename must be terminated with a null byte!");
    }

    if body.get(mode_at + MODE.len()) != Some(&0x00) {
        return parse_error("Mode must be terminated with a null byte!");
    }

    String::from_utf8(body[..mode_at - 1].to_vec())
        .map_err(|_| SocketError::PacketParse("Filename is not valid UTF-8".to_string()))
}

/// Returns bytes `4..n` of a received Data packet.
pub fn extract_payload(buf: &[u8], n: usize) -> TftpResult<Vec<u8>> {
    if n < HEADER_SIZE || n > buf.len() {
        return parse_error("Data packet length is out of bounds!");
    }
    Ok(buf[HEADER_SIZE..n].to_vec())
}

/// Builds a ReadReq/WriteReq datagram. Fails when the filename does not fit in one packet.
pub fn encode_request(op: OpCode, filename: &str) -> TftpResult<Vec<u8>> {
    if op != OpCode::Rrq && op != OpCode::Wrq {
        return Err(SocketError::PacketParse(format!("{:?} is not a request opcode", op)));
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(SocketError::PacketParse(format!(
            "Filename is {} bytes long, at most {MAX_FILENAME_LEN} fit in a request",
            filename.len()
        )));
    }
    if filename.as_bytes().contains(&0x00) {
        return parse_error("Filename cannot contain a null byte!");
    }

    let mut buf = Vec::with_capacity(2 + filename.len() + 1 + MODE.len() + 1);
    buf.extend_from_slice(&op.code().to_le_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(MODE.as_bytes());
    buf.push(0x00);
    Ok(buf)
}

pub fn encode_data(block: u16, payload: &[u8]) -> TftpResult<Vec<u8>> {
    if payload.len() > DATA_BUFFER_SIZE {
        return Err(SocketError::PacketParse(format!(
            "Data payload of {} bytes exceeds the {DATA_BUFFER_SIZE} byte block size",
            payload.len()
        )));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&OpCode::Data.code().to_le_bytes());
    buf.extend_from_slice(&block.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

pub fn encode_ack(block: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    buf.extend_from_slice(&OpCode::Ack.code().to_le_bytes());
    buf.extend_from_slice(&block.to_le_bytes());
    buf
}

/// Builds the fixed-size Error datagram for `code`, carrying the code's description.
pub fn encode_error(code: ErrorCode) -> Vec<u8> {
    error_bytes(code, code.description())
}

fn error_bytes(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut buf = vec![0_u8; MAX_PACKET_SIZE];
    buf[..2].copy_from_slice(&OpCode::Error.code().to_le_bytes());
    buf[2..4].copy_from_slice(&code.code().to_le_bytes());

    // Leave room for the terminating NUL, which the zeroed tail already provides.
    let msg = message.as_bytes();
    let len = msg.len().min(MAX_PACKET_SIZE - HEADER_SIZE - 1);
    buf[HEADER_SIZE..HEADER_SIZE + len].copy_from_slice(&msg[..len]);
    buf
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = decode_opcode(buf)?;
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(format!("Unknown opcode retrieved: {rawcode}"))),
    }
}

fn parse_error_packet(buf: &[u8]) -> TftpResult<Packet> {
    let code = ErrorCode::from_code(decode_block_num(buf)?);
    let (message, _) = string_from_buffer(&buf[HEADER_SIZE..]);
    Ok(Packet::Error { code, message })
}

impl Packet {
    /// An Error packet whose message is the code's description.
    pub fn error(code: ErrorCode) -> Packet {
        Packet::Error { code, message: code.description().to_string() }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    pub fn encode(&self) -> TftpResult<Vec<u8>> {
        match self {
            Packet::ReadReq { path } => encode_request(OpCode::Rrq, path),
            Packet::WriteReq { path } => encode_request(OpCode::Wrq, path),
            Packet::Data { block, data } => encode_data(*block, data),
            Packet::Ack { block } => Ok(encode_ack(*block)),
            Packet::Error { code, message } if message == code.description() => Ok(encode_error(*code)),
            Packet::Error { code, message } => Ok(error_bytes(*code, message)),
        }
    }

    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < HEADER_SIZE {
            return parse_error("Packet too short!");
        }
        if buf.len() > MAX_PACKET_SIZE {
            return Err(SocketError::PacketParse(format!(
                "Packet of {} bytes is larger than {MAX_PACKET_SIZE} bytes",
                buf.len()
            )));
        }

        match retrieve_op_code(buf)? {
            OpCode::Rrq => Ok(Packet::ReadReq { path: decode_filename(buf)? }),
            OpCode::Wrq => Ok(Packet::WriteReq { path: decode_filename(buf)? }),
            OpCode::Data => Ok(Packet::Data {
                block: decode_block_num(buf)?,
                data: extract_payload(buf, buf.len())?,
            }),
            OpCode::Ack => Ok(Packet::Ack { block: decode_block_num(buf)? }),
            OpCode::Error => parse_error_packet(buf),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Packet::ReadReq { path } => write!(f, "RRQ '{}'", path),
            Packet::WriteReq { path } => write!(f, "WRQ '{}'", path),
            Packet::Data { block, data } => write!(f, "DATA #{} ({} bytes)", block, data.len()),
            Packet::Ack { block } => write!(f, "ACK #{}", block),
            Packet::Error { code, message } => write!(f, "ERROR {:?} '{}'", code, message),
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        let bytes = packet.encode()?;
        self.sock.send_to(&bytes, dst).await?;
        Ok(())
    }

    /// Waits for the next datagram with no deadline.
    pub async fn recv(&self) -> TftpResult<(Packet, SocketAddr)> {
        // One spare byte so oversized datagrams are detected instead of silently truncated.
        let mut buf = [0; MAX_PACKET_SIZE + 1];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;

        let packet = Packet::parse_from_buf(&buf[..total_written]).map_err(|e| match e {
            SocketError::PacketParse(reason) => SocketError::Malformed { src, reason },
            e => e,
        })?;
        Ok((packet, src))
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        timeout(ttl, self.recv()).await?
    }
}
