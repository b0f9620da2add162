/// Transfer unit for REQUEST/PIECE exchanges. Clients reject requests
/// larger than this.
pub const BLOCK_SIZE: u32 = 16384;
