use std::path::PathBuf;

use swarm_core::{hash_id::Id20, lengths::Lengths};

/// One file of the torrent's logical byte layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub relative_path: PathBuf,
    pub length: u64,
}

/// The parsed torrent metadata the engine consumes. Producing this
/// (bencoded `.torrent` parsing, ut_metadata fetch) is the metadata
/// source's job, not the engine's.
#[derive(Debug, Clone)]
pub struct Torrent {
    pub info_hash: Id20,
    pub name: String,
    pub piece_length: u32,
    pub files: Vec<TorrentFile>,
    pub piece_hashes: Vec<Id20>,
}

impl Torrent {
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn lengths(&self) -> anyhow::Result<Lengths> {
        self.lengths_with_block_length(swarm_core::constants::BLOCK_SIZE)
    }

    pub fn lengths_with_block_length(&self, block_length: u32) -> anyhow::Result<Lengths> {
        // a block can't outgrow its piece
        let block_length = block_length.min(self.piece_length);
        let lengths =
            Lengths::new_with_block_length(self.total_length(), self.piece_length, block_length)?;
        if self.piece_hashes.len() != lengths.total_pieces() as usize {
            anyhow::bail!(
                "torrent has {} piece hashes but {} pieces",
                self.piece_hashes.len(),
                lengths.total_pieces()
            );
        }
        Ok(lengths)
    }
}

/// External collaborator that resolves a torrent id to its parsed
/// metadata (e.g. over ut_metadata for magnet links).
pub trait MetadataSource: Send + Sync {
    fn fetch(&self, info_hash: Id20) -> anyhow::Result<Torrent>;
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use swarm_core::sha1w::{ISha1, Sha1};

    /// A single-file torrent whose content is `fill` repeated, hashed
    /// piece by piece.
    pub fn single_file_torrent(content: &[u8], piece_length: u32) -> Torrent {
        let piece_hashes = content
            .chunks(piece_length as usize)
            .map(|piece| {
                let mut h = Sha1::new();
                h.update(piece);
                Id20::new(h.finish())
            })
            .collect();
        Torrent {
            info_hash: Id20::new([7u8; 20]),
            name: "test".into(),
            piece_length,
            files: vec![TorrentFile {
                relative_path: "test.bin".into(),
                length: content.len() as u64,
            }],
            piece_hashes,
        }
    }

    /// Multi-file variant; pieces span file boundaries.
    pub fn multi_file_torrent(contents: &[&[u8]], piece_length: u32) -> Torrent {
        let all: Vec<u8> = contents.concat();
        let piece_hashes = all
            .chunks(piece_length as usize)
            .map(|piece| {
                let mut h = Sha1::new();
                h.update(piece);
                Id20::new(h.finish())
            })
            .collect();
        Torrent {
            info_hash: Id20::new([9u8; 20]),
            name: "test-multi".into(),
            piece_length,
            files: contents
                .iter()
                .enumerate()
                .map(|(idx, c)| TorrentFile {
                    relative_path: format!("file-{idx}.bin").into(),
                    length: c.len() as u64,
                })
                .collect(),
            piece_hashes,
        }
    }
}
