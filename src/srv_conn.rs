// This module contains the server-side connection handler.
//
// Server connections are initiated when a ReadReq or a WriteReq is received on the control
// channel. The dispatch loop hands each one to a ServerRequestHandler, which works in roughly the
// following stages:
//
// 1. Resolve the requested filename against the server root and set up the packet processor. For
//    reads this opens the file; if that fails the session ends right here, without a word to the
//    client, which will simply time out.
// 2. Bind a fresh data socket on a random port and talk to the client's source address from it.
// 3. Send the opening packet (Data 1 for reads, Ack 0 for writes) and alternate between work and
//    wait until the processor reports completion or failure.
//
// Each handler owns its socket, file and processor. Nothing is shared with the dispatch loop or
// with other handlers, and everything is released when the handler is dropped.

use crate::config::ServerConfig;
use crate::conn::Connection;
use crate::processor::{Operation, PacketProcessor, TransferError, TransferSummary};
use crate::tftp::{self, Packet};
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Random ports tried before letting the OS pick one.
const BIND_ATTEMPTS: usize = 16;

/// An object responsible for handling a request.
pub struct ServerRequestHandler {
    conn: Connection,

    /// The packet processor.
    processor: PacketProcessor,
}

/// The operation and filename of a packet that may open a session, or `None` for anything that
/// does not belong on the control channel.
pub fn admit(packet: &Packet) -> Option<(Operation, &str)> {
    match packet {
        Packet::ReadReq { path } => Some((Operation::Get, path.as_str())),
        Packet::WriteReq { path } => Some((Operation::Put, path.as_str())),
        _ => None,
    }
}

/// Attempts to bind to a random UDP port, falling back to an OS-assigned one.
fn bind_random_socket(ip: IpAddr) -> tftp::TftpResult<tftp::TftpSocket> {
    let mut rng = rand::thread_rng();
    for _ in 0..BIND_ATTEMPTS {
        let port: u16 = rng.gen_range(1024..65535);
        match tftp::TftpSocket::bind(SocketAddr::new(ip, port)) {
            Ok(sock) => return Ok(sock),
            Err(e) => log::warn!("Couldn't bind socket: {}", e),
        }
    }
    tftp::TftpSocket::bind(SocketAddr::new(ip, 0))
}

/// Maps a requested filename into the server root. A leading `/` is treated as the root itself.
fn resolve(root: &Path, requested: &str) -> PathBuf {
    let open_path = requested.strip_prefix('/').unwrap_or(requested);
    root.join(open_path)
}

impl ServerRequestHandler {
    pub async fn new(
        config: &ServerConfig,
        initial_request: &Packet,
        src: SocketAddr,
    ) -> Result<ServerRequestHandler, TransferError> {
        let (operation, path) = admit(initial_request).ok_or_else(|| {
            TransferError::BadRequest("Only read and write requests are valid initial requests.".to_string())
        })?;
        let local = resolve(&config.root, path);

        let processor = match operation {
            Operation::Get => match PacketProcessor::new_for_reading(&local, config.read).await {
                Ok(p) => p,
                Err(e) => {
                    log::error!("Cannot serve {:?} to {}: {}", local, src, e);
                    return Err(e.into());
                },
            },
            Operation::Put => PacketProcessor::new_for_writing(&local, config.write),
        };

        let sock = bind_random_socket(config.bind_addr.ip())?;
        log::info!("Serving {} of {:?} to {} from {}", operation, local, src, sock.local_addr()?);

        Ok(ServerRequestHandler {
            conn: Connection::new(sock, Some(src)),
            processor,
        })
    }

    /// Does the work of sending and receiving data over the connection until the connection closes
    pub async fn handle(mut self) -> Result<TransferSummary, TransferError> {
        let first = self.processor.first_packet().await;
        self.conn.run(&mut self.processor, first).await
    }
}
