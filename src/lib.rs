//! PeerChat - Peer-to-peer chat
//!
//! Peers find each other through a rendezvous server and then talk directly
//! over framed TCP connections driven by a single-threaded reactor.

pub mod config;
pub mod peer;
pub mod protocol;
pub mod reactor;
pub mod rendezvous;
