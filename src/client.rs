// Client side of a transfer.
//
// The request goes out once over the control channel, with no retry of its own. The server
// answers from a fresh port of its own to the port the request came from, so the socket that sent
// the request is the one the data phase runs on. From there the client is an ordinary session:
// GET receives (acknowledging every Data packet and only trusting silence after the final one),
// PUT sends (waiting for Ack 0 before the first block).

use crate::config::ClientConfig;
use crate::conn::Connection;
use crate::processor::{Operation, PacketProcessor, ResultAction, TransferError, TransferSummary};
use crate::tftp::{Packet, SocketError, TftpSocket};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// One transfer as requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub operation: Operation,

    /// File on this machine: written by a GET, read by a PUT.
    pub local: PathBuf,

    /// Filename as the server knows it.
    pub remote: String,
}

pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Client {
        Client { config }
    }

    pub async fn run(&self, request: &TransferRequest) -> Result<TransferSummary, TransferError> {
        match request.operation {
            Operation::Get => self.get(&request.local, &request.remote).await,
            Operation::Put => self.put(&request.local, &request.remote).await,
        }
    }

    /// Reads `remote` from the server into `local`. `local` is only created once the whole file
    /// has arrived.
    pub async fn get(&self, local: &Path, remote: &str) -> Result<TransferSummary, TransferError> {
        let sock = self.send_request(&Packet::ReadReq { path: remote.to_string() }).await?;
        let mut processor = PacketProcessor::new_for_writing(local, self.config.read);

        let mut conn = Connection::new(sock, None);
        let summary = conn.run(&mut processor, ResultAction::RetryRecv).await?;
        log::info!(
            "Read '{}' from {} into {:?}: {} bytes in {} blocks",
            remote,
            conn.peer().unwrap_or(self.config.server_addr),
            local,
            summary.bytes,
            summary.blocks
        );
        Ok(summary)
    }

    /// Writes `local` to the server as `remote`.
    pub async fn put(&self, local: &Path, remote: &str) -> Result<TransferSummary, TransferError> {
        // Opened before the request goes out, so a missing local file never starts a session
        // on the server.
        let mut processor = PacketProcessor::new_for_reading(local, self.config.write).await?;
        let sock = self.send_request(&Packet::WriteReq { path: remote.to_string() }).await?;

        // The server opens with Ack 0; there is nothing to send until it arrives.
        let mut conn = Connection::new(sock, None);
        let summary = conn.run(&mut processor, ResultAction::RetryRecv).await?;
        log::info!(
            "Wrote {:?} to '{}' on {}: {} bytes in {} blocks",
            local,
            remote,
            conn.peer().unwrap_or(self.config.server_addr),
            summary.bytes,
            summary.blocks
        );
        Ok(summary)
    }

    async fn send_request(&self, request: &Packet) -> Result<TftpSocket, TransferError> {
        let server = self.config.server_addr;
        let sock = TftpSocket::bind(local_bind_addr(&server))?;
        sock.send(request, server).await.map_err(|e| match e {
            SocketError::PacketParse(msg) => TransferError::BadRequest(msg),
            e => e.into(),
        })?;
        log::info!("Sent {} to {} from {}", request, server, sock.local_addr()?);
        Ok(sock)
    }
}

/// An ephemeral port on an interface that can reach `server`.
fn local_bind_addr(server: &SocketAddr) -> SocketAddr {
    let ip: IpAddr = match server.ip() {
        ip if ip.is_loopback() => ip,
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    SocketAddr::new(ip, 0)
}
