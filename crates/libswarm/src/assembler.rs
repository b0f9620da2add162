// Buffers incoming blocks per piece until the piece is complete, at
// which point the caller hashes it and either commits it to the store
// or throws it away and requeues the piece.

use std::collections::HashMap;

use swarm_core::lengths::{BlockInfo, Lengths, ValidPieceIndex};
use tracing::trace;

use crate::type_aliases::BF;

struct InflightPiece {
    blocks: BF,
    buf: Box<[u8]>,
}

#[derive(Debug)]
pub enum BlockMarkingResult {
    /// All blocks of the piece arrived; here is the assembled piece.
    Completed(Box<[u8]>),
    NotCompleted,
    /// The block (or the whole piece) was already received.
    Duplicate,
}

pub struct BlockAssembler {
    lengths: Lengths,
    inflight: HashMap<ValidPieceIndex, InflightPiece>,
}

impl BlockAssembler {
    pub fn new(lengths: Lengths) -> Self {
        Self {
            lengths,
            inflight: HashMap::new(),
        }
    }

    pub fn record_block(&mut self, block: &BlockInfo, data: &[u8]) -> BlockMarkingResult {
        debug_assert_eq!(block.size as usize, data.len());
        let piece = block.piece_index;
        let blocks_per_piece = self.lengths.blocks_per_piece(piece) as usize;
        let entry = self.inflight.entry(piece).or_insert_with(|| InflightPiece {
            blocks: BF::repeat(false, blocks_per_piece),
            buf: vec![0u8; self.lengths.piece_length(piece) as usize].into_boxed_slice(),
        });

        if entry.blocks[block.block_index as usize] {
            return BlockMarkingResult::Duplicate;
        }
        entry.blocks.set(block.block_index as usize, true);
        let offset = block.offset as usize;
        entry.buf[offset..offset + data.len()].copy_from_slice(data);
        trace!(
            "piece={}, block={}, received={:?}",
            piece,
            block.block_index,
            entry.blocks
        );

        if entry.blocks.all() {
            let entry = self.inflight.remove(&piece).unwrap();
            return BlockMarkingResult::Completed(entry.buf);
        }
        BlockMarkingResult::NotCompleted
    }

    /// Blocks of the piece that have not arrived yet. The request
    /// producer uses this to avoid re-requesting received blocks.
    pub fn missing_blocks(&self, piece: ValidPieceIndex) -> Vec<BlockInfo> {
        match self.inflight.get(&piece) {
            Some(entry) => self
                .lengths
                .iter_block_infos(piece)
                .filter(|b| !entry.blocks[b.block_index as usize])
                .collect(),
            None => self.lengths.iter_block_infos(piece).collect(),
        }
    }

    pub fn has_block(&self, block: &BlockInfo) -> bool {
        self.inflight
            .get(&block.piece_index)
            .map(|e| e.blocks[block.block_index as usize])
            .unwrap_or(false)
    }

    /// Drops a partially assembled piece (hash mismatch, piece
    /// requeued).
    pub fn discard(&mut self, piece: ValidPieceIndex) {
        self.inflight.remove(&piece);
    }

    pub fn clear(&mut self) {
        self.inflight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembles_out_of_order() {
        let lengths = Lengths::new(16384 * 2 + 100, 16384 * 3).unwrap();
        let mut a = BlockAssembler::new(lengths);
        let piece = lengths.validate_piece_index(0).unwrap();
        let blocks: Vec<_> = lengths.iter_block_infos(piece).collect();
        assert_eq!(blocks.len(), 3);

        let payloads: Vec<Vec<u8>> = blocks
            .iter()
            .map(|b| vec![b.block_index as u8; b.size as usize])
            .collect();

        assert!(matches!(
            a.record_block(&blocks[2], &payloads[2]),
            BlockMarkingResult::NotCompleted
        ));
        assert!(matches!(
            a.record_block(&blocks[0], &payloads[0]),
            BlockMarkingResult::NotCompleted
        ));
        assert!(matches!(
            a.record_block(&blocks[2], &payloads[2]),
            BlockMarkingResult::Duplicate
        ));
        let assembled = match a.record_block(&blocks[1], &payloads[1]) {
            BlockMarkingResult::Completed(buf) => buf,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(assembled.len(), lengths.piece_length(piece) as usize);
        assert_eq!(&assembled[..16384], &payloads[0][..]);
        assert_eq!(&assembled[16384..32768], &payloads[1][..]);
        assert_eq!(&assembled[32768..], &payloads[2][..100]);
    }

    #[test]
    fn test_missing_blocks_shrinks_as_blocks_arrive() {
        let lengths = Lengths::new(16384 * 4, 16384 * 4).unwrap();
        let mut a = BlockAssembler::new(lengths);
        let piece = lengths.validate_piece_index(0).unwrap();
        assert_eq!(a.missing_blocks(piece).len(), 4);

        let block = lengths.iter_block_infos(piece).next().unwrap();
        a.record_block(&block, &vec![0u8; block.size as usize]);
        let missing = a.missing_blocks(piece);
        assert_eq!(missing.len(), 3);
        assert!(!missing.iter().any(|b| b.block_index == 0));
    }

    #[test]
    fn test_discard_resets_piece() {
        let lengths = Lengths::new(16384 * 2, 16384 * 2).unwrap();
        let mut a = BlockAssembler::new(lengths);
        let piece = lengths.validate_piece_index(0).unwrap();
        let block = lengths.iter_block_infos(piece).next().unwrap();
        a.record_block(&block, &vec![0u8; block.size as usize]);
        a.discard(piece);
        assert_eq!(a.missing_blocks(piece).len(), 2);
    }
}
