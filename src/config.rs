// Deadlines and endpoints for both halves of the protocol.
//
// Client and server run with different constants for the same role. A receiver's data deadline
// should exceed the peer's ack deadline, otherwise a single lost Data packet ends the session
// before the sender gets to retransmit it.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Well-known control port the server listens on.
pub const DEFAULT_PORT: u16 = 1201;

pub fn default_server_addr() -> SocketAddr {
    (Ipv4Addr::LOCALHOST, DEFAULT_PORT).into()
}

/// Deadlines for the side that receives Data and sends Acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveTimeouts {
    /// How long to wait for each Data packet before the final one shows up. Expiry is fatal.
    pub data: Duration,

    /// How long to keep re-acknowledging after the final Data packet. Expiry means the peer has
    /// stopped retransmitting and the transfer is complete.
    pub drain: Duration,
}

/// Deadlines for the side that sends Data and waits for Acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendTimeouts {
    /// How long to wait for each Ack.
    pub ack: Duration,

    /// Number of Ack timeouts a session survives. The timeout that reaches this count aborts the
    /// session, every earlier one retransmits the last Data packet. The count never resets.
    pub max_timeouts: u32,
}

/// Settings for the client engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Control endpoint the requests are sent to.
    pub server_addr: SocketAddr,
    pub read: ReceiveTimeouts,
    pub write: SendTimeouts,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_addr: default_server_addr(),
            read: ReceiveTimeouts {
                data: Duration::from_secs(8),
                drain: Duration::from_secs(8),
            },
            write: SendTimeouts {
                ack: Duration::from_secs(4),
                max_timeouts: 4,
            },
        }
    }
}

/// Settings for the dispatch loop and its workers.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Control endpoint to listen on.
    pub bind_addr: SocketAddr,

    /// Directory requested filenames are resolved against.
    pub root: PathBuf,

    /// Used when serving read requests.
    pub read: SendTimeouts,

    /// Used when serving write requests.
    pub write: ReceiveTimeouts,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: default_server_addr(),
            root: PathBuf::from("."),
            read: SendTimeouts {
                ack: Duration::from_secs(10),
                max_timeouts: 5,
            },
            write: ReceiveTimeouts {
                data: Duration::from_secs(18),
                drain: Duration::from_secs(5),
            },
        }
    }
}
