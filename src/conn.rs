// The work-and-wait loop every session runs on its data channel.
//
// A `Connection` performs whatever `ResultAction` the processor hands it, then blocks on the
// socket with the processor's deadline. The received packet, or the expiry of the deadline, goes
// back into the processor to produce the next action. That blocking read is the only place a
// session ever suspends.

use crate::processor::{PacketProcessor, ResultAction, TransferError, TransferSummary};
use crate::tftp::{ErrorCode, Packet, SocketError, TftpSocket};
use std::net::SocketAddr;

pub struct Connection {
    /// Data channel socket, owned for the lifetime of the session.
    sock: TftpSocket,

    /// Where packets go. A client does not know the server's data port until the first packet
    /// arrives; after that, packets from any other source are rejected.
    peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new(sock: TftpSocket, peer: Option<SocketAddr>) -> Connection {
        Connection { sock, peer }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Drives `processor` starting from `first` until the session ends.
    pub async fn run(
        &mut self,
        processor: &mut PacketProcessor,
        first: ResultAction,
    ) -> Result<TransferSummary, TransferError> {
        let mut action = first;
        loop {
            match action {
                ResultAction::SendPacketAndAwait(packet) => self.send(&packet).await?,
                ResultAction::RetryRecv => {},
                ResultAction::Complete => return Ok(processor.summary()),
                ResultAction::Abort(e) => return Err(e),
                ResultAction::TerminateWithPacket(packet, e) => {
                    // Error packet is sent as a courtesy, we don't care how it goes.
                    if let Err(send_err) = self.send(&packet).await {
                        log::warn!("Unable to send {}: {}", packet, send_err);
                    }
                    return Err(e);
                },
            }
            action = self.next_action(processor).await?;
        }
    }

    async fn send(&self, packet: &Packet) -> Result<(), TransferError> {
        let dst = self
            .peer
            .ok_or_else(|| TransferError::Internal(format!("No peer known to send {} to", packet)))?;
        log::debug!("Sending {} to {}", packet, dst);
        self.sock.send(packet, dst).await?;
        Ok(())
    }

    fn is_stray(&self, src: SocketAddr) -> bool {
        matches!(self.peer, Some(peer) if peer != src)
    }

    /// Answers a source that is not our peer with Unknown TID. The session itself is unaffected.
    async fn reject_stray(&self, src: SocketAddr, what: &str) {
        log::warn!("Got {} from {}, but this connection belongs to {:?}", what, src, self.peer);
        let packet = Packet::error(ErrorCode::UnknownTid);
        if let Err(e) = self.sock.send(&packet, src).await {
            log::warn!("Unable to send {} to {}: {}", packet, src, e);
        }
    }

    async fn next_action(&mut self, processor: &mut PacketProcessor) -> Result<ResultAction, TransferError> {
        loop {
            let (packet, src) = match self.sock.recv_with_timeout(processor.recv_timeout()).await {
                Ok(received) => received,
                Err(SocketError::Timeout(_)) => return Ok(processor.on_timeout().await),
                Err(SocketError::Malformed { src, reason }) => {
                    if self.is_stray(src) {
                        self.reject_stray(src, "an unparseable packet").await;
                        continue;
                    }
                    return Err(TransferError::Protocol(format!("Error parsing incoming packet: {reason}")));
                },
                Err(e) => return Err(e.into()),
            };

            if self.is_stray(src) {
                self.reject_stray(src, &packet.to_string()).await;
                // Continue waiting for a good packet from the expected peer.
                continue;
            }
            if self.peer.is_none() {
                log::debug!("Data channel peer is {}", src);
                self.peer = Some(src);
            }

            log::debug!("Got {} from {}", packet, src);
            return Ok(processor.process_packet(&packet).await);
        }
    }
}
