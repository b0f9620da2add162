use std::net::SocketAddr;

pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;
pub type BS = bitvec::slice::BitSlice<u8, bitvec::order::Msb0>;

/// Peers are identified by their socket address within one torrent.
pub type PeerHandle = SocketAddr;

pub use swarm_core::sha1w::Sha1;
