pub mod packet;
pub mod socket;

pub use packet::*;
pub use socket::*;

use thiserror::Error;

/// Errors raised while building or validating ICMP messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IcmpError {
    #[error("packet size {0} is smaller than the 8-byte timestamp")]
    PacketTooSmall(usize),
    #[error("malformed ICMP message: {0}")]
    Malformed(&'static str),
    #[error("bad ICMP checksum")]
    BadChecksum,
    #[error("unexpected ICMP type {0}")]
    UnexpectedType(u8),
    #[error("reply id={identifier} seq={sequence} does not match this request")]
    IdentityMismatch { identifier: u16, sequence: u16 },
}
