//! Rendezvous module - Peer address registry
//!
//! Provides:
//! - A server that records (address, port) registrations and answers listings
//! - A client for one-shot register and list round trips
//!
//! Requests are a single opcode byte (plus an int32 port for REGISTER) and
//! clients use one TCP connection per request.

mod client;
mod server;

pub use client::*;
pub use server::*;

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

use crate::reactor::ReactorError;

/// Request opcodes
pub mod request {
    /// Ask for every registered entry
    pub const LIST: u8 = 0x1A;
    /// Register the caller's address with the int32 port that follows
    pub const REGISTER: u8 = 0x1B;
}

/// Bytes per entry in a LIST response
pub const ENTRY_LEN: usize = 8;

/// Largest entry count a client accepts from a LIST response
pub const MAX_LIST_ENTRIES: usize = 16 * 1024;

/// Rendezvous errors
#[derive(Error, Debug)]
pub enum RendezvousError {
    #[error("Rendezvous unreachable: {0}")]
    Unreachable(#[from] io::Error),

    #[error("Rendezvous request timed out")]
    Timeout,

    #[error("Rendezvous protocol error: {0}")]
    Protocol(&'static str),

    #[error("Reactor error: {0}")]
    Reactor(#[from] ReactorError),
}

pub type RendezvousResult<T> = Result<T, RendezvousError>;

/// A registered peer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RendezvousEntry {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl RendezvousEntry {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.addr), self.port)
    }
}

impl fmt::Display for RendezvousEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Encode a LIST response: int32 count, then (IPv4, int32 port) per entry
pub fn encode_list(entries: &[RendezvousEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + entries.len() * ENTRY_LEN);
    buf.put_i32(entries.len() as i32);
    for entry in entries {
        buf.put_slice(&entry.addr.octets());
        buf.put_i32(i32::from(entry.port));
    }
    buf.freeze()
}

/// Encode a REGISTER request
pub fn encode_register(port: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(request::REGISTER);
    buf.put_i32(i32::from(port));
    buf.freeze()
}

/// The IPv4 address a caller is recorded under
///
/// IPv4-mapped IPv6 addresses are unwrapped; other IPv6 addresses have no
/// representation in the listing.
pub fn observed_ipv4(addr: &SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_encode_list_layout() {
        let entries = [
            RendezvousEntry::new(Ipv4Addr::new(10, 0, 0, 1), 9119),
            RendezvousEntry::new(Ipv4Addr::new(192, 168, 1, 20), 1),
        ];
        let bytes = encode_list(&entries);

        assert_eq!(bytes.len(), 4 + 2 * ENTRY_LEN);
        assert_eq!(&bytes[..4], &[0, 0, 0, 2]);
        assert_eq!(&bytes[4..8], &[10, 0, 0, 1]);
        assert_eq!(&bytes[8..12], &9119i32.to_be_bytes());
        assert_eq!(&bytes[12..16], &[192, 168, 1, 20]);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_encode_empty_list() {
        assert_eq!(&encode_list(&[])[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_register() {
        assert_eq!(&encode_register(9119)[..], &[0x1B, 0, 0, 0x23, 0x9F]);
    }

    #[test]
    fn test_observed_ipv4() {
        let v4: SocketAddr = "10.1.2.3:5".parse().unwrap();
        assert_eq!(observed_ipv4(&v4), Some(Ipv4Addr::new(10, 1, 2, 3)));

        let mapped = SocketAddr::new(IpAddr::V6(Ipv4Addr::new(10, 1, 2, 3).to_ipv6_mapped()), 5);
        assert_eq!(observed_ipv4(&mapped), Some(Ipv4Addr::new(10, 1, 2, 3)));

        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 5);
        assert_eq!(observed_ipv4(&v6), None);
    }
}
