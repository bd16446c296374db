// Per-session bookkeeping for the stop-and-wait data phase.
//
// A session is either sending a local file (reading it block by block and waiting for Acks) or
// receiving one (assembling Data payloads in memory and acknowledging them). The same two state
// machines serve both the client and the server; only the deadlines differ, and those come in
// through `config`.
//
// Processors never touch the network. They are fed packets and timeouts by `conn::Connection` and
// answer with a `ResultAction` describing what the caller should do next.

use crate::config::{ReceiveTimeouts, SendTimeouts};
use crate::tftp::{self, ErrorCode, Packet, SocketError};
use std::error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{self, AsyncReadExt};

/// Direction of a transfer, named from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Client reads a remote file.
    Get,
    /// Client writes a remote file.
    Put,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operation::Get => write!(f, "GET"),
            Operation::Put => write!(f, "PUT"),
        }
    }
}

/// What a successful session moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Payload bytes sent or received, duplicates excluded.
    pub bytes: u64,

    /// Distinct Data packets sent or received.
    pub blocks: u32,
}

/// Every way a session can end other than success.
#[derive(Debug)]
pub enum TransferError {
    /// The socket failed for a reason other than a deadline.
    Socket(SocketError),
    /// The retry budget ran out, or no progress was made before the first deadline.
    TimedOut { block: u16 },
    /// The peer sent something the state machine does not accept at this point.
    Protocol(String),
    /// The peer ended the session with an Error packet.
    PeerError { code: ErrorCode, message: String },
    /// The local file could not be opened, read or written.
    File(io::Error),
    /// The request could not be built or admitted.
    BadRequest(String),
    Internal(String),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "{}", e),
            Self::TimedOut { block } => write!(f, "Timed out waiting on block {}", block),
            Self::Protocol(msg) => write!(f, "Protocol violation: {}", msg),
            Self::PeerError { code, message } => {
                write!(f, "Peer sent error {:?} (code {}): '{}'", code, code.code(), message)
            }
            Self::File(e) => write!(f, "File IO error: {}", e),
            Self::BadRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<SocketError> for TransferError {
    fn from(e: SocketError) -> Self {
        TransferError::Socket(e)
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::File(e)
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet or a timeout.
#[derive(Debug)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(Packet),

    /// Caller should keep waiting without sending anything.
    RetryRecv,

    /// The transfer finished successfully; caller should close the connection.
    Complete,

    /// Caller should close the connection without sending anything and report the error.
    Abort(TransferError),

    /// Caller should send the packet as a courtesy, then close the connection and report the error.
    TerminateWithPacket(Packet, TransferError),
}

#[derive(Debug)]
pub enum PacketProcessor {
    Read(ReadProcessor),
    Write(WriteProcessor),
}

/// An entity that can process packets and produce a response.
impl PacketProcessor {
    /// A processor that sends the contents of `path`.
    pub async fn new_for_reading(path: &Path, config: SendTimeouts) -> Result<PacketProcessor, io::Error> {
        let f = File::open(path).await?;
        Ok(PacketProcessor::Read(ReadProcessor::new(f, config)))
    }

    /// A processor that receives a file and writes it to `path` once the transfer completes.
    /// Nothing is created on disk before that.
    pub fn new_for_writing(path: &Path, config: ReceiveTimeouts) -> PacketProcessor {
        log::debug!("Will write to {:?} on completion", path);
        PacketProcessor::Write(WriteProcessor::new(path.to_path_buf(), config))
    }

    /// The packet the server opens a session with: Data block 1 for reads, Ack 0 for writes.
    pub async fn first_packet(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.process_ack(&Packet::Ack { block: 0 }).await,
            PacketProcessor::Write(_) => ResultAction::SendPacketAndAwait(Packet::Ack { block: 0 }),
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &Packet) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.process_ack(packet).await,
            PacketProcessor::Write(p) => p.process_data(packet),
        }
    }

    /// Called when the deadline returned by `recv_timeout` expires without a packet.
    pub async fn on_timeout(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.on_timeout(),
            PacketProcessor::Write(p) => p.on_timeout().await,
        }
    }

    /// How long the caller should wait for the next packet.
    pub fn recv_timeout(&self) -> Duration {
        match self {
            PacketProcessor::Read(p) => p.config.ack,
            PacketProcessor::Write(p) => p.recv_timeout(),
        }
    }

    pub fn summary(&self) -> TransferSummary {
        match self {
            PacketProcessor::Read(p) => TransferSummary { bytes: p.bytes, blocks: p.blocks },
            PacketProcessor::Write(p) => TransferSummary { bytes: p.buf.len() as u64, blocks: p.blocks },
        }
    }
}

#[derive(Debug)]
pub struct ReadProcessor {
    f: File,
    curr_block: u16,
    awaiting_final_ack: bool,
    last_sent: Option<Packet>,
    timeouts: u32,
    bytes: u64,
    blocks: u32,
    config: SendTimeouts,
}

impl ReadProcessor {
    fn new(f: File, config: SendTimeouts) -> ReadProcessor {
        ReadProcessor {
            f,
            curr_block: 0,
            awaiting_final_ack: false,
            last_sent: None,
            timeouts: 0,
            bytes: 0,
            blocks: 0,
            config,
        }
    }

    async fn process_ack(&mut self, packet: &Packet) -> ResultAction {
        match packet {
            Packet::Ack { block } if *block == self.curr_block => {
                if self.awaiting_final_ack {
                    return ResultAction::Complete;
                }
                match read_block_from_file(&mut self.f).await {
                    Ok(data) => {
                        self.curr_block = self.curr_block.wrapping_add(1);
                        // A short block, possibly empty, is the last one. A file whose length is
                        // a multiple of the block size therefore ends with an empty Data packet.
                        if data.len() < tftp::DATA_BUFFER_SIZE {
                            self.awaiting_final_ack = true;
                        }
                        self.bytes += data.len() as u64;
                        self.blocks += 1;

                        let packet = Packet::Data { block: self.curr_block, data };
                        self.last_sent = Some(packet.clone());
                        ResultAction::SendPacketAndAwait(packet)
                    },
                    Err(e) => ResultAction::TerminateWithPacket(
                        Packet::error(e.kind().into()),
                        TransferError::File(e),
                    ),
                }
            },
            Packet::Ack { block } => ResultAction::Abort(TransferError::Protocol(format!(
                "Expected an ack for block {cb}, but received an ack for {block}",
                cb = self.curr_block
            ))),
            Packet::Error { code, message } => ResultAction::Abort(TransferError::PeerError {
                code: *code,
                message: message.clone(),
            }),
            _ => ResultAction::Abort(TransferError::Protocol(format!(
                "Expected to receive an Ack packet, but got {:?} instead",
                packet.op_code()
            ))),
        }
    }

    fn on_timeout(&mut self) -> ResultAction {
        self.timeouts += 1;
        match &self.last_sent {
            // Nothing has been acknowledged yet, so there is nothing to retransmit.
            None => ResultAction::Abort(TransferError::TimedOut { block: self.curr_block }),
            Some(_) if self.timeouts >= self.config.max_timeouts => {
                ResultAction::Abort(TransferError::TimedOut { block: self.curr_block })
            },
            Some(packet) => {
                log::debug!(
                    "No ack for block {} (timeout {} of {}), retransmitting",
                    self.curr_block, self.timeouts, self.config.max_timeouts
                );
                ResultAction::SendPacketAndAwait(packet.clone())
            },
        }
    }
}

async fn read_block_from_file(f: &mut File) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; tftp::DATA_BUFFER_SIZE];
    let mut cursor = 0;

    // A single read may return fewer bytes than requested without being at EOF, so keep going
    // until the block is full or the file is exhausted.
    loop {
        let s = f.read(&mut buf[cursor..]).await?;
        cursor += s;
        if cursor == buf.len() || s == 0 {
            buf.truncate(cursor);
            return Ok(buf);
        }
    }
}

/// True if `block` lies within the half of the sequence space just before `expected`.
fn is_behind(block: u16, expected: u16) -> bool {
    (expected.wrapping_sub(block) as i16) > 0
}

#[derive(Debug)]
pub struct WriteProcessor {
    dest: PathBuf,
    buf: Vec<u8>,
    last_acked: u16,
    last_packet_seen: bool,
    blocks: u32,
    config: ReceiveTimeouts,
}

impl WriteProcessor {
    fn new(dest: PathBuf, config: ReceiveTimeouts) -> WriteProcessor {
        WriteProcessor {
            dest,
            buf: Vec::new(),
            last_acked: 0,
            last_packet_seen: false,
            blocks: 0,
            config,
        }
    }

    fn recv_timeout(&self) -> Duration {
        if self.last_packet_seen {
            self.config.drain
        } else {
            self.config.data
        }
    }

    fn process_data(&mut self, packet: &Packet) -> ResultAction {
        match packet {
            Packet::Data { block, data } => {
                let expected = self.last_acked.wrapping_add(1);
                if *block == expected && !self.last_packet_seen {
                    self.buf.extend_from_slice(data);
                    self.last_acked = *block;
                    self.blocks += 1;
                    if data.len() < tftp::DATA_BUFFER_SIZE {
                        self.last_packet_seen = true;
                    }
                    ResultAction::SendPacketAndAwait(Packet::Ack { block: *block })
                } else if is_behind(*block, expected) {
                    // Our ack got lost and the peer retransmitted. Acknowledge again, keep the
                    // buffer as it is.
                    log::debug!("Duplicate data block {block}, re-acknowledging");
                    ResultAction::SendPacketAndAwait(Packet::Ack { block: *block })
                } else {
                    ResultAction::Abort(TransferError::Protocol(format!(
                        "Data blocks must be received in sequence. Received data for block {block}, \
                        but only received up to block {cb}.", cb = self.last_acked)))
                }
            },
            Packet::Error { code, message } => ResultAction::Abort(TransferError::PeerError {
                code: *code,
                message: message.clone(),
            }),
            _ => ResultAction::Abort(TransferError::Protocol(format!(
                "Expected to receive a Data packet, but got {:?} instead",
                packet.op_code()
            ))),
        }
    }

    async fn on_timeout(&mut self) -> ResultAction {
        if !self.last_packet_seen {
            return ResultAction::Abort(TransferError::TimedOut { block: self.last_acked.wrapping_add(1) });
        }

        // The peer stopped retransmitting the final block, so it has our last ack.
        match fs::write(&self.dest, &self.buf).await {
            Ok(()) => ResultAction::Complete,
            Err(e) => ResultAction::Abort(TransferError::File(e)),
        }
    }
}
