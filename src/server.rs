// The listening side.
//
// One socket on the well-known address receives requests and nothing else. Every ReadReq or
// WriteReq starts an independent worker task with a data socket of its own; anything else that
// lands on the control channel is dropped without a reply. Workers report back over a channel
// once their session has ended, and the dispatch loop never waits on them.

use crate::config::ServerConfig;
use crate::processor::{Operation, TransferError, TransferSummary};
use crate::srv_conn::{self, ServerRequestHandler};
use crate::tftp::{SocketError, TftpResult, TftpSocket};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// How a single session ended.
#[derive(Debug)]
pub struct SessionReport {
    pub peer: SocketAddr,
    pub operation: Operation,
    pub filename: String,
    pub result: Result<TransferSummary, TransferError>,
}

impl SessionReport {
    pub fn log(&self) {
        match &self.result {
            Ok(summary) => log::info!(
                "{} '{}' for {} done: {} bytes in {} blocks",
                self.operation,
                self.filename,
                self.peer,
                summary.bytes,
                summary.blocks
            ),
            Err(e) => log::warn!("{} '{}' for {} failed: {}", self.operation, self.filename, self.peer, e),
        }
    }
}

pub struct Server {
    sock: TftpSocket,
    config: ServerConfig,
}

impl Server {
    pub fn bind(config: ServerConfig) -> TftpResult<Server> {
        let sock = TftpSocket::bind(config.bind_addr)?;
        log::info!("Listening on {}, serving {:?}", sock.local_addr()?, config.root);
        Ok(Server { sock, config })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    /// Serves forever, logging every finished session.
    pub async fn run(self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionReport>();
        tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                report.log();
            }
        });
        self.serve(tx).await
    }

    /// Accepts requests forever. Each finished session is sent on `reports`; a closed receiver
    /// only means nobody is listening.
    pub async fn serve(self, reports: mpsc::UnboundedSender<SessionReport>) {
        loop {
            let (packet, src) = match self.sock.recv().await {
                Ok(received) => received,
                Err(SocketError::Malformed { src, reason }) => {
                    log::debug!("Dropping unparseable packet from {} on the control channel: {}", src, reason);
                    continue;
                },
                Err(e) => {
                    log::warn!("Control channel receive failed: {}", e);
                    continue;
                },
            };

            let Some((operation, filename)) = srv_conn::admit(&packet) else {
                log::debug!("Dropping {} from {} on the control channel", packet, src);
                continue;
            };
            log::info!("Got {} from {}", packet, src);

            let filename = filename.to_string();
            let config = self.config.clone();
            let reports = reports.clone();
            tokio::spawn(async move {
                let result = match ServerRequestHandler::new(&config, &packet, src).await {
                    Ok(handler) => handler.handle().await,
                    Err(e) => Err(e),
                };
                let report = SessionReport { peer: src, operation, filename, result };
                if let Err(mpsc::error::SendError(report)) = reports.send(report) {
                    report.log();
                }
            });
        }
    }
}
