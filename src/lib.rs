// A small TFTP-style file transfer over UDP, client and server.
//
// Transfer begins with a request to read or write a file, sent to the server's control port. The
// server answers from a fresh port of its own, and the whole data phase runs between that port and
// the port the request came from. The file moves in blocks of 512 bytes. Each Data packet carries
// one block and must be acked before the next one is sent. A Data packet shorter than 512 bytes
// ends the transfer; a file whose length is a multiple of 512 ends with an empty one.
//
// On loss, the sender times out and retransmits its last Data packet. The receiver acks every Data
// packet it sees, including duplicates, and only the next block in sequence is ever stored. After
// the final block the receiver lingers for a while so that a lost final ack can be made good.
//
// Errors end the session. An Error packet may be sent as a courtesy; it is never acked or
// retransmitted. The one error that does not end a session is a packet from the wrong source port:
// that source gets an Unknown TID error and the session carries on.
//
// Wire format. All integers are 16 bits, little-endian.
//
// opcode   operation
// 1        Read req (ReadReq)
// 2        Write req (WriteReq)
// 3        Data
// 4        Ack
// 5        Error
//
// ReadReq/WriteReq:  opcode | Filename | 0x00 | "octet" | 0x00
// Data:              opcode | Block # | Data (0-512 bytes)
// Ack:               opcode | Block #
// Error:             opcode | ErrorCode | ErrMsg | 0x00, zero-padded to 516 bytes
//
// Error codes
//
// 0    Not defined, see msg
// 1    File not found
// 2    Access violation
// 3    Disk full / alloc exceeded
// 4    Illegal TFTP op
// 5    Unknown TID
// 6    File already exists
// 7    No such user

pub mod client;
pub mod config;
pub mod conn;
pub mod processor;
pub mod server;
pub mod srv_conn;
pub mod tftp;

pub use client::{Client, TransferRequest};
pub use config::{ClientConfig, ServerConfig};
pub use processor::{Operation, TransferError, TransferSummary};
pub use server::{Server, SessionReport};
