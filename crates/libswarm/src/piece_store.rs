// Maps pieces onto per-file storage units and owns the verified
// bitfield. The bitfield only ever gains bits, and a bit is set under
// the same lock that commits the piece bytes, so "verified" always
// implies the data is in storage.

use anyhow::Context;
use parking_lot::Mutex;
use swarm_core::{
    hash_id::Id20,
    lengths::{Lengths, ValidPieceIndex},
    sha1w::{ISha1, Sha1},
};
use tracing::{debug, trace, warn};

use crate::{
    metainfo::Torrent,
    storage::{read_block_fully, write_block_fully, Storage, StorageUnit},
    type_aliases::BF,
};

struct FileSpan {
    unit: Box<dyn StorageUnit>,
    offset_in_torrent: u64,
    len: u64,
}

struct VerifiedState {
    verified: BF,
    verified_bytes: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PieceCommitResult {
    Verified,
    AlreadyVerified,
    HashMismatch,
}

pub struct DataDescriptor {
    lengths: Lengths,
    piece_hashes: Vec<Id20>,
    files: Vec<FileSpan>,
    locked: Mutex<VerifiedState>,
}

impl DataDescriptor {
    pub fn new(torrent: &Torrent, storage: &dyn Storage) -> anyhow::Result<Self> {
        Self::new_with_block_length(torrent, storage, swarm_core::constants::BLOCK_SIZE)
    }

    pub fn new_with_block_length(
        torrent: &Torrent,
        storage: &dyn Storage,
        block_length: u32,
    ) -> anyhow::Result<Self> {
        let lengths = torrent.lengths_with_block_length(block_length)?;
        let mut files = Vec::with_capacity(torrent.files.len());
        let mut offset = 0u64;
        for file in &torrent.files {
            let unit = storage
                .open_unit(file)
                .with_context(|| format!("error opening storage for {:?}", file.relative_path))?;
            files.push(FileSpan {
                unit,
                offset_in_torrent: offset,
                len: file.length,
            });
            offset += file.length;
        }
        Ok(Self {
            locked: Mutex::new(VerifiedState {
                verified: BF::repeat(false, lengths.total_pieces() as usize),
                verified_bytes: 0,
            }),
            lengths,
            piece_hashes: torrent.piece_hashes.clone(),
            files,
        })
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    pub fn digest(&self, piece: ValidPieceIndex) -> Id20 {
        self.piece_hashes[piece.get() as usize]
    }

    /// Calls `f` for each (file, in-file offset, span length) the
    /// given absolute range crosses, in layout order.
    fn for_each_segment(
        &self,
        mut abs_offset: u64,
        mut remaining: usize,
        mut f: impl FnMut(&FileSpan, u64, usize) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        for span in &self.files {
            if remaining == 0 {
                break;
            }
            if abs_offset >= span.offset_in_torrent + span.len {
                continue;
            }
            let in_file = abs_offset - span.offset_in_torrent;
            let to_io = std::cmp::min((span.len - in_file) as usize, remaining);
            f(span, in_file, to_io)?;
            abs_offset += to_io as u64;
            remaining -= to_io;
        }
        if remaining != 0 {
            anyhow::bail!("range extends past the end of the torrent");
        }
        Ok(())
    }

    pub fn read_block(
        &self,
        piece: ValidPieceIndex,
        offset: u32,
        buf: &mut [u8],
    ) -> anyhow::Result<()> {
        let abs = self.lengths.piece_offset(piece) + offset as u64;
        let mut pos = 0usize;
        self.for_each_segment(abs, buf.len(), |span, in_file, len| {
            read_block_fully(&*span.unit, in_file, &mut buf[pos..pos + len])
                .with_context(|| format!("error reading {len} bytes at {in_file}"))?;
            pos += len;
            Ok(())
        })
    }

    fn write_piece_data(&self, piece: ValidPieceIndex, data: &[u8]) -> anyhow::Result<()> {
        let abs = self.lengths.piece_offset(piece);
        let mut pos = 0usize;
        self.for_each_segment(abs, data.len(), |span, in_file, len| {
            write_block_fully(&*span.unit, in_file, &data[pos..pos + len])
                .with_context(|| format!("error writing {len} bytes at {in_file}"))?;
            pos += len;
            Ok(())
        })
    }

    /// Hashes an assembled piece and, on a digest match, writes it
    /// through to storage and marks it verified, atomically with
    /// respect to other committers and readers of the bitfield.
    pub fn commit_piece(
        &self,
        piece: ValidPieceIndex,
        data: &[u8],
    ) -> anyhow::Result<PieceCommitResult> {
        if data.len() != self.lengths.piece_length(piece) as usize {
            anyhow::bail!(
                "piece {} has length {}, got {} bytes",
                piece,
                self.lengths.piece_length(piece),
                data.len()
            );
        }
        let mut hash = Sha1::new();
        hash.update(data);
        if hash.finish() != self.digest(piece).0 {
            warn!("checksum for piece={} did not validate", piece);
            return Ok(PieceCommitResult::HashMismatch);
        }

        let mut g = self.locked.lock();
        if g.verified[piece.get() as usize] {
            debug!("piece={} was already verified, ignoring", piece);
            return Ok(PieceCommitResult::AlreadyVerified);
        }
        self.write_piece_data(piece, data)?;
        g.verified.set(piece.get() as usize, true);
        g.verified_bytes += data.len() as u64;
        trace!("piece={} committed and verified", piece);
        Ok(PieceCommitResult::Verified)
    }

    pub fn is_verified(&self, piece: ValidPieceIndex) -> bool {
        self.locked.lock().verified[piece.get() as usize]
    }

    pub fn verified_bitfield(&self) -> BF {
        self.locked.lock().verified.clone()
    }

    /// Raw bitfield bytes padded to the wire length, tail bits zero.
    pub fn verified_bitfield_bytes(&self) -> Vec<u8> {
        let g = self.locked.lock();
        let mut out = g.verified.clone().into_vec();
        out.resize(self.lengths.piece_bitfield_bytes(), 0);
        out
    }

    pub fn verified_bytes(&self) -> u64 {
        self.locked.lock().verified_bytes
    }

    pub fn verified_pieces(&self) -> u32 {
        self.locked.lock().verified.count_ones() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.verified_pieces() == self.lengths.total_pieces()
    }

    /// Re-hashes whatever the storage already holds and seeds the
    /// verified bitfield, so a resumed download skips finished pieces.
    pub fn initial_check(&self) -> anyhow::Result<u32> {
        let mut found = 0;
        let mut buf = vec![0u8; self.lengths.default_piece_length() as usize];
        for piece_info in self.lengths.iter_piece_infos() {
            let piece = piece_info.piece_index;
            let buf = &mut buf[..piece_info.len as usize];
            match self.read_block(piece, 0, buf) {
                Ok(()) => {}
                // absent data is simply an unfinished piece
                Err(_) => continue,
            }
            let mut hash = Sha1::new();
            hash.update(buf);
            if hash.finish() == self.digest(piece).0 {
                let mut g = self.locked.lock();
                if !g.verified[piece.get() as usize] {
                    g.verified.set(piece.get() as usize, true);
                    g.verified_bytes += piece_info.len as u64;
                    found += 1;
                }
            }
        }
        if found > 0 {
            debug!("initial check: {} pieces already present", found);
        }
        Ok(found)
    }

    pub fn close(&self) -> anyhow::Result<()> {
        for (idx, span) in self.files.iter().enumerate() {
            span.unit
                .close()
                .with_context(|| format!("error closing storage unit {idx}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::test_util::{multi_file_torrent, single_file_torrent};
    use crate::storage::InMemoryStorage;

    #[test]
    fn test_commit_sets_bit_exactly_once() {
        let content = vec![b'A'; 16384];
        let torrent = single_file_torrent(&content, 16384);
        let d = DataDescriptor::new(&torrent, &InMemoryStorage).unwrap();
        let piece = d.lengths().validate_piece_index(0).unwrap();

        assert!(!d.is_verified(piece));
        assert_eq!(
            d.commit_piece(piece, &content).unwrap(),
            PieceCommitResult::Verified
        );
        assert!(d.is_verified(piece));
        assert_eq!(d.verified_bytes(), 16384);

        assert_eq!(
            d.commit_piece(piece, &content).unwrap(),
            PieceCommitResult::AlreadyVerified
        );
        assert_eq!(d.verified_bytes(), 16384);
    }

    #[test]
    fn test_hash_mismatch_does_not_set_bit() {
        let content = vec![b'A'; 16384];
        let torrent = single_file_torrent(&content, 16384);
        let d = DataDescriptor::new(&torrent, &InMemoryStorage).unwrap();
        let piece = d.lengths().validate_piece_index(0).unwrap();

        let bad = vec![b'B'; 16384];
        assert_eq!(
            d.commit_piece(piece, &bad).unwrap(),
            PieceCommitResult::HashMismatch
        );
        assert!(!d.is_verified(piece));
        assert_eq!(d.verified_bytes(), 0);
    }

    #[test]
    fn test_pieces_cross_file_boundaries() {
        // three files of odd sizes, two pieces
        let f0 = vec![1u8; 100];
        let f1 = vec![2u8; 17];
        let f2 = vec![3u8; 139];
        let torrent = multi_file_torrent(&[&f0, &f1, &f2], 128);
        let d = DataDescriptor::new(&torrent, &InMemoryStorage).unwrap();
        let all: Vec<u8> = [&f0[..], &f1[..], &f2[..]].concat();

        for piece_info in d.lengths().iter_piece_infos() {
            let start = d.lengths().piece_offset(piece_info.piece_index) as usize;
            let data = &all[start..start + piece_info.len as usize];
            assert_eq!(
                d.commit_piece(piece_info.piece_index, data).unwrap(),
                PieceCommitResult::Verified
            );
        }
        assert!(d.is_complete());

        // read back one block straddling all three files
        let piece = d.lengths().validate_piece_index(0).unwrap();
        let mut buf = vec![0u8; 128];
        d.read_block(piece, 0, &mut buf).unwrap();
        assert_eq!(&buf[..], &all[..128]);
    }

    #[test]
    fn test_initial_check_finds_existing_pieces() {
        let content = [vec![b'x'; 300], vec![b'y'; 212]].concat();
        let torrent = single_file_torrent(&content, 256);
        let storage = InMemoryStorage;
        let d = DataDescriptor::new(&torrent, &storage).unwrap();
        let p0 = d.lengths().validate_piece_index(0).unwrap();
        d.commit_piece(p0, &content[..256]).unwrap();

        // a new descriptor over the same unit would re-find the data;
        // the in-memory unit is per-descriptor, so just re-check this one
        let found = d.initial_check().unwrap();
        assert_eq!(found, 0); // already accounted for
        assert!(d.is_verified(p0));
        assert_eq!(d.verified_pieces(), 1);
    }
}
