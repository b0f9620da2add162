use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How the client advertises encryption support in the extended
/// handshake. Only the advertisement is implemented; transport
/// encryption itself is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionPolicy {
    RequirePlaintext,
    #[default]
    PreferPlaintext,
    PreferEncrypted,
    RequireEncrypted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP port we accept connections on; advertised as `p` in the
    /// extended handshake.
    pub acceptor_port: u16,
    pub encryption_policy: EncryptionPolicy,

    pub min_pex_message_interval: Duration,
    pub max_pex_message_interval: Duration,
    pub min_pex_events_per_message: usize,
    pub max_pex_events_per_message: usize,

    pub max_pending_requests_per_peer: usize,
    /// Per-peer bound on blocks read from storage but not yet written
    /// to the socket; requests beyond it are dropped.
    pub max_enqueued_peer_requests: usize,
    pub block_size: u32,

    pub choke_interval: Duration,
    /// Every Nth choker tick additionally unchokes one random
    /// interested peer.
    pub optimistic_unchoke_every: u32,
    pub regular_unchoke_slots: usize,

    pub assignment_deadline: Duration,
    pub max_assigned_pieces_per_peer: usize,
    /// Floor for the endgame trigger; the effective threshold is this
    /// or 5% of the torrent's pieces, whichever is larger.
    pub endgame_threshold_pieces: u32,

    pub peer_connect_timeout: Duration,
    pub keep_alive_interval: Duration,

    pub client_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            acceptor_port: 6881,
            encryption_policy: EncryptionPolicy::default(),
            min_pex_message_interval: Duration::from_secs(60),
            max_pex_message_interval: Duration::from_secs(120),
            min_pex_events_per_message: 10,
            max_pex_events_per_message: 50,
            max_pending_requests_per_peer: 10,
            max_enqueued_peer_requests: 32,
            block_size: swarm_core::constants::BLOCK_SIZE,
            choke_interval: Duration::from_secs(10),
            optimistic_unchoke_every: 3,
            regular_unchoke_slots: 4,
            assignment_deadline: Duration::from_secs(20),
            max_assigned_pieces_per_peer: 3,
            endgame_threshold_pieces: 8,
            peer_connect_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(120),
            client_version: concat!("libswarm ", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_pex_message_interval < self.min_pex_message_interval {
            return Err(Error::InvalidConfig(
                "max PEX message interval is smaller than min interval".into(),
            ));
        }
        if self.min_pex_events_per_message > self.max_pex_events_per_message {
            return Err(Error::InvalidConfig(
                "min PEX events per message exceeds max".into(),
            ));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if self.block_size > swarm_core::constants::BLOCK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "block size {} exceeds the 16 KiB protocol limit",
                self.block_size
            )));
        }
        if self.max_pending_requests_per_peer == 0 {
            return Err(Error::InvalidConfig(
                "max pending requests per peer can't be 0".into(),
            ));
        }
        if self.regular_unchoke_slots == 0 {
            return Err(Error::InvalidConfig("unchoke slots can't be 0".into()));
        }
        if self.optimistic_unchoke_every == 0 {
            return Err(Error::InvalidConfig(
                "optimistic unchoke period can't be 0".into(),
            ));
        }
        if self.max_assigned_pieces_per_peer == 0 {
            return Err(Error::InvalidConfig(
                "max assigned pieces per peer can't be 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_swapped_pex_intervals_fail_fast() {
        let cfg = Config {
            min_pex_message_interval: Duration::from_secs(120),
            max_pex_message_interval: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_oversized_block_rejected() {
        let cfg = Config {
            block_size: 32768,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
