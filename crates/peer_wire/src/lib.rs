// BitTorrent peer protocol: message parsing and serialization.
//
// The decoder works on a contiguous byte view and either returns a
// complete message together with the number of consumed bytes, or a
// NotEnoughData error, in which case nothing was consumed and the
// caller should read more from the socket and retry.

pub mod extended;

use bencode::{ByteBuf, ByteBufOwned, CloneToOwned};
use byteorder::{ByteOrder, BE};
use swarm_core::{constants::BLOCK_SIZE, hash_id::Id20, lengths::BlockInfo};

use self::extended::{ExtendedMessage, PeerExtendedMessageIds};

const INTEGER_LEN: usize = 4;
const MSGID_LEN: usize = 1;
const PREAMBLE_LEN: usize = INTEGER_LEN + MSGID_LEN;
const PIECE_MESSAGE_PREAMBLE_LEN: usize = PREAMBLE_LEN + INTEGER_LEN * 2;
pub const PIECE_MESSAGE_DEFAULT_LEN: usize = PIECE_MESSAGE_PREAMBLE_LEN + BLOCK_SIZE as usize;

const NO_PAYLOAD_MSG_LEN: usize = PREAMBLE_LEN;

const PSTR_BT1: &str = "BitTorrent protocol";

const LEN_PREFIX_KEEPALIVE: u32 = 0;
const LEN_PREFIX_CHOKE: u32 = 1;
const LEN_PREFIX_UNCHOKE: u32 = 1;
const LEN_PREFIX_INTERESTED: u32 = 1;
const LEN_PREFIX_NOT_INTERESTED: u32 = 1;
const LEN_PREFIX_HAVE: u32 = 5;
const LEN_PREFIX_PORT: u32 = 3;
const LEN_PREFIX_PIECE: u32 = 9;
const LEN_PREFIX_REQUEST: u32 = 13;

const MSGID_CHOKE: u8 = 0;
const MSGID_UNCHOKE: u8 = 1;
const MSGID_INTERESTED: u8 = 2;
const MSGID_NOT_INTERESTED: u8 = 3;
const MSGID_HAVE: u8 = 4;
const MSGID_BITFIELD: u8 = 5;
const MSGID_REQUEST: u8 = 6;
const MSGID_PIECE: u8 = 7;
const MSGID_CANCEL: u8 = 8;
const MSGID_PORT: u8 = 9;
const MSGID_EXTENDED: u8 = 20;

/// The extension id under which we accept ut_pex, advertised in our
/// extended handshake.
pub const MY_EXTENDED_UT_PEX: u8 = 1;

#[derive(thiserror::Error, Debug)]
pub enum MessageDeserializeError {
    #[error("not enough data to deserialize {1}: expected at least {0} more bytes")]
    NotEnoughData(usize, &'static str),
    #[error("unsupported message id {0}")]
    UnsupportedMessageId(u8),
    #[error("incorrect len prefix for message id {msg_id}, expected {expected}, received {received}")]
    IncorrectLenPrefix {
        received: u32,
        expected: u32,
        msg_id: u8,
    },
    #[error("error deserializing bencoded payload: {0}")]
    Bencode(#[from] bencode::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MessageDeserializeError {
    /// True when the input was merely incomplete, i.e. more socket
    /// reads may fix it. Everything else is a protocol error.
    pub fn is_not_enough_data(&self) -> bool {
        matches!(self, MessageDeserializeError::NotEnoughData(..))
    }
}

/// Writes the length prefix, message id and the (piece, begin) header
/// of a PIECE message, so the block payload can be read from storage
/// straight into the send buffer behind it.
pub fn serialize_piece_preamble(block: &BlockInfo, mut buf: &mut [u8]) -> usize {
    BE::write_u32(&mut buf[0..4], LEN_PREFIX_PIECE + block.size);
    buf[4] = MSGID_PIECE;

    buf = &mut buf[PREAMBLE_LEN..];
    BE::write_u32(&mut buf[0..4], block.piece_index.get());
    BE::write_u32(&mut buf[4..8], block.offset);

    PIECE_MESSAGE_PREAMBLE_LEN
}

#[derive(Debug, PartialEq, Eq)]
pub struct Piece<B> {
    pub index: u32,
    pub begin: u32,
    pub block: B,
}

impl<B> Piece<B>
where
    B: AsRef<[u8]>,
{
    pub fn from_data<T>(index: u32, begin: u32, block: T) -> Piece<B>
    where
        B: From<T>,
    {
        Piece {
            index,
            begin,
            block: B::from(block),
        }
    }

    pub fn len(&self) -> usize {
        self.block.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.block.as_ref().is_empty()
    }

    fn serialize(&self, mut buf: &mut [u8]) -> usize {
        BE::write_u32(&mut buf[0..4], self.index);
        BE::write_u32(&mut buf[4..8], self.begin);
        buf = &mut buf[8..];
        buf.copy_from_slice(self.block.as_ref());
        self.block.as_ref().len() + 8
    }

    fn deserialize<'a>(buf: &'a [u8]) -> Piece<B>
    where
        B: From<&'a [u8]> + 'a,
    {
        let index = BE::read_u32(&buf[0..4]);
        let begin = BE::read_u32(&buf[4..8]);
        let block = B::from(&buf[8..]);
        Piece {
            index,
            begin,
            block,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    fn serialize(&self, buf: &mut [u8]) {
        BE::write_u32(&mut buf[0..4], self.index);
        BE::write_u32(&mut buf[4..8], self.begin);
        BE::write_u32(&mut buf[8..12], self.length);
    }

    fn deserialize(buf: &[u8]) -> Self {
        Self {
            index: BE::read_u32(&buf[0..4]),
            begin: BE::read_u32(&buf[4..8]),
            length: BE::read_u32(&buf[8..12]),
        }
    }
}

impl From<&BlockInfo> for Request {
    fn from(b: &BlockInfo) -> Self {
        Request {
            index: b.piece_index.get(),
            begin: b.offset,
            length: b.size,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Message<B: AsRef<[u8]>> {
    Request(Request),
    Cancel(Request),
    Bitfield(B),
    KeepAlive,
    Have(u32),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Piece(Piece<B>),
    Port(u16),
    Extended(ExtendedMessage<B>),
}

pub type MessageBorrowed<'a> = Message<ByteBuf<'a>>;
pub type MessageOwned = Message<ByteBufOwned>;

impl<B> CloneToOwned for Message<B>
where
    B: AsRef<[u8]> + CloneToOwned,
    <B as CloneToOwned>::Target: AsRef<[u8]>,
{
    type Target = Message<<B as CloneToOwned>::Target>;

    fn clone_to_owned(&self) -> Self::Target {
        match self {
            Message::Request(req) => Message::Request(*req),
            Message::Cancel(req) => Message::Cancel(*req),
            Message::Bitfield(b) => Message::Bitfield(b.clone_to_owned()),
            Message::KeepAlive => Message::KeepAlive,
            Message::Have(v) => Message::Have(*v),
            Message::Choke => Message::Choke,
            Message::Unchoke => Message::Unchoke,
            Message::Interested => Message::Interested,
            Message::NotInterested => Message::NotInterested,
            Message::Piece(piece) => Message::Piece(Piece {
                index: piece.index,
                begin: piece.begin,
                block: piece.block.clone_to_owned(),
            }),
            Message::Port(v) => Message::Port(*v),
            Message::Extended(e) => Message::Extended(e.clone_to_owned()),
        }
    }
}

impl<B> Message<B>
where
    B: AsRef<[u8]>,
{
    pub fn len_prefix_and_msg_id(&self) -> (u32, u8) {
        match self {
            Message::Request(_) => (LEN_PREFIX_REQUEST, MSGID_REQUEST),
            Message::Cancel(_) => (LEN_PREFIX_REQUEST, MSGID_CANCEL),
            Message::Bitfield(b) => (1 + b.as_ref().len() as u32, MSGID_BITFIELD),
            Message::Choke => (LEN_PREFIX_CHOKE, MSGID_CHOKE),
            Message::Unchoke => (LEN_PREFIX_UNCHOKE, MSGID_UNCHOKE),
            Message::Interested => (LEN_PREFIX_INTERESTED, MSGID_INTERESTED),
            Message::NotInterested => (LEN_PREFIX_NOT_INTERESTED, MSGID_NOT_INTERESTED),
            Message::Piece(p) => (LEN_PREFIX_PIECE + p.block.as_ref().len() as u32, MSGID_PIECE),
            Message::KeepAlive => (LEN_PREFIX_KEEPALIVE, 0),
            Message::Have(_) => (LEN_PREFIX_HAVE, MSGID_HAVE),
            Message::Port(_) => (LEN_PREFIX_PORT, MSGID_PORT),
            // computed after the payload is written
            Message::Extended(_) => (0, MSGID_EXTENDED),
        }
    }

    pub fn serialize(
        &self,
        out: &mut Vec<u8>,
        peer_extended_msg_ids: &dyn Fn() -> PeerExtendedMessageIds,
    ) -> anyhow::Result<usize> {
        let (lp, msg_id) = self.len_prefix_and_msg_id();

        out.resize(PREAMBLE_LEN, 0);

        BE::write_u32(&mut out[..4], lp);
        out[4] = msg_id;

        match self {
            Message::Request(request) | Message::Cancel(request) => {
                const MSG_LEN: usize = PREAMBLE_LEN + 12;
                out.resize(MSG_LEN, 0);
                request.serialize(&mut out[PREAMBLE_LEN..]);
                Ok(MSG_LEN)
            }
            Message::Bitfield(b) => {
                let block_len = b.as_ref().len();
                let msg_len = PREAMBLE_LEN + block_len;
                out.resize(msg_len, 0);
                out[PREAMBLE_LEN..].copy_from_slice(b.as_ref());
                Ok(msg_len)
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                Ok(PREAMBLE_LEN)
            }
            Message::Piece(p) => {
                let payload_len = 8 + p.block.as_ref().len();
                let msg_len = PREAMBLE_LEN + payload_len;
                out.resize(msg_len, 0);
                p.serialize(&mut out[PREAMBLE_LEN..]);
                Ok(msg_len)
            }
            Message::KeepAlive => {
                // the len prefix was already written out, drop the msg id byte
                out.truncate(INTEGER_LEN);
                Ok(INTEGER_LEN)
            }
            Message::Have(v) => {
                let msg_len = PREAMBLE_LEN + 4;
                out.resize(msg_len, 0);
                BE::write_u32(&mut out[PREAMBLE_LEN..], *v);
                Ok(msg_len)
            }
            Message::Port(v) => {
                let msg_len = PREAMBLE_LEN + 2;
                out.resize(msg_len, 0);
                BE::write_u16(&mut out[PREAMBLE_LEN..], *v);
                Ok(msg_len)
            }
            Message::Extended(e) => {
                e.serialize(out, peer_extended_msg_ids)?;
                let msg_size = out.len();
                BE::write_u32(&mut out[..4], (msg_size - INTEGER_LEN) as u32);
                Ok(msg_size)
            }
        }
    }

    pub fn deserialize<'a>(buf: &'a [u8]) -> Result<(Message<B>, usize), MessageDeserializeError>
    where
        B: From<&'a [u8]> + 'a,
    {
        let len_prefix = match buf.get(0..4) {
            Some(bytes) => BE::read_u32(bytes),
            None => return Err(MessageDeserializeError::NotEnoughData(4 - buf.len(), "message")),
        };
        if len_prefix == 0 {
            return Ok((Message::KeepAlive, 4));
        }

        let msg_id = match buf.get(4) {
            Some(msg_id) => *msg_id,
            None => return Err(MessageDeserializeError::NotEnoughData(1, "message")),
        };
        let rest = &buf[5..];

        let check_fixed = |expected: u32| -> Result<(), MessageDeserializeError> {
            if len_prefix != expected {
                return Err(MessageDeserializeError::IncorrectLenPrefix {
                    received: len_prefix,
                    expected,
                    msg_id,
                });
            }
            Ok(())
        };

        match msg_id {
            MSGID_CHOKE => {
                check_fixed(LEN_PREFIX_CHOKE)?;
                Ok((Message::Choke, NO_PAYLOAD_MSG_LEN))
            }
            MSGID_UNCHOKE => {
                check_fixed(LEN_PREFIX_UNCHOKE)?;
                Ok((Message::Unchoke, NO_PAYLOAD_MSG_LEN))
            }
            MSGID_INTERESTED => {
                check_fixed(LEN_PREFIX_INTERESTED)?;
                Ok((Message::Interested, NO_PAYLOAD_MSG_LEN))
            }
            MSGID_NOT_INTERESTED => {
                check_fixed(LEN_PREFIX_NOT_INTERESTED)?;
                Ok((Message::NotInterested, NO_PAYLOAD_MSG_LEN))
            }
            MSGID_HAVE => {
                check_fixed(LEN_PREFIX_HAVE)?;
                let expected_len = 4;
                match rest.get(..expected_len) {
                    Some(h) => Ok((Message::Have(BE::read_u32(h)), PREAMBLE_LEN + expected_len)),
                    None => Err(MessageDeserializeError::NotEnoughData(
                        expected_len - rest.len(),
                        "have",
                    )),
                }
            }
            MSGID_PORT => {
                check_fixed(LEN_PREFIX_PORT)?;
                let expected_len = 2;
                match rest.get(..expected_len) {
                    Some(p) => Ok((Message::Port(BE::read_u16(p)), PREAMBLE_LEN + expected_len)),
                    None => Err(MessageDeserializeError::NotEnoughData(
                        expected_len - rest.len(),
                        "port",
                    )),
                }
            }
            MSGID_BITFIELD => {
                if len_prefix <= 1 {
                    return Err(MessageDeserializeError::IncorrectLenPrefix {
                        expected: 2,
                        received: len_prefix,
                        msg_id,
                    });
                }
                let expected_len = len_prefix as usize - 1;
                match rest.get(..expected_len) {
                    Some(bitfield) => Ok((
                        Message::Bitfield(B::from(bitfield)),
                        PREAMBLE_LEN + expected_len,
                    )),
                    None => Err(MessageDeserializeError::NotEnoughData(
                        expected_len - rest.len(),
                        "bitfield",
                    )),
                }
            }
            MSGID_REQUEST | MSGID_CANCEL => {
                check_fixed(LEN_PREFIX_REQUEST)?;
                let expected_len = 12;
                match rest.get(..expected_len) {
                    Some(b) => {
                        let request = Request::deserialize(b);
                        let msg = if msg_id == MSGID_REQUEST {
                            Message::Request(request)
                        } else {
                            Message::Cancel(request)
                        };
                        Ok((msg, PREAMBLE_LEN + expected_len))
                    }
                    None => Err(MessageDeserializeError::NotEnoughData(
                        expected_len - rest.len(),
                        if msg_id == MSGID_REQUEST {
                            "request"
                        } else {
                            "cancel"
                        },
                    )),
                }
            }
            MSGID_PIECE => {
                if len_prefix <= LEN_PREFIX_PIECE {
                    return Err(MessageDeserializeError::IncorrectLenPrefix {
                        expected: LEN_PREFIX_PIECE + 1,
                        received: len_prefix,
                        msg_id,
                    });
                }
                // len prefix counts the msg id byte and the two
                // u32 header fields, the rest is the block itself.
                let expected_len = len_prefix as usize - 1;
                match rest.get(..expected_len) {
                    Some(b) => Ok((
                        Message::Piece(Piece::deserialize(b)),
                        PREAMBLE_LEN + expected_len,
                    )),
                    None => Err(MessageDeserializeError::NotEnoughData(
                        expected_len - rest.len(),
                        "piece",
                    )),
                }
            }
            MSGID_EXTENDED => {
                if len_prefix < 2 {
                    return Err(MessageDeserializeError::IncorrectLenPrefix {
                        expected: 2,
                        received: len_prefix,
                        msg_id,
                    });
                }
                let expected_len = len_prefix as usize - 1;
                match rest.get(..expected_len) {
                    Some(b) => Ok((
                        Message::Extended(ExtendedMessage::deserialize(b)?),
                        PREAMBLE_LEN + expected_len,
                    )),
                    None => Err(MessageDeserializeError::NotEnoughData(
                        expected_len - rest.len(),
                        "extended",
                    )),
                }
            }
            msg_id => Err(MessageDeserializeError::UnsupportedMessageId(msg_id)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Id20,
    pub peer_id: Id20,
}

const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

impl Handshake {
    pub fn new(info_hash: Id20, peer_id: Id20) -> Handshake {
        debug_assert_eq!(PSTR_BT1.len(), 19);

        // bit 20 of the reserved field advertises extended messaging
        let mut reserved_arr = [0u8; 8];
        BE::write_u64(&mut reserved_arr, 1 << 20);

        Handshake {
            reserved: reserved_arr,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved[5] & 0x10 > 0
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.push(PSTR_BT1.len() as u8);
        buf.extend_from_slice(PSTR_BT1.as_bytes());
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash.0);
        buf.extend_from_slice(&self.peer_id.0);
    }

    pub fn deserialize(b: &[u8]) -> Result<(Handshake, usize), MessageDeserializeError> {
        let pstr_len = *b
            .first()
            .ok_or(MessageDeserializeError::NotEnoughData(1, "handshake"))?;
        if pstr_len as usize != PSTR_BT1.len() {
            return Err(MessageDeserializeError::Other(anyhow::anyhow!(
                "pstr should be {} bytes long, but received {}",
                PSTR_BT1.len(),
                pstr_len
            )));
        }
        let hbuf = b
            .get(..HANDSHAKE_LEN)
            .ok_or(MessageDeserializeError::NotEnoughData(
                HANDSHAKE_LEN - b.len(),
                "handshake",
            ))?;
        if &hbuf[1..20] != PSTR_BT1.as_bytes() {
            return Err(MessageDeserializeError::Other(anyhow::anyhow!(
                "pstr doesn't match bittorrent V1"
            )));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&hbuf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&hbuf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&hbuf[48..68]);
        Ok((
            Handshake {
                reserved,
                info_hash: Id20::new(info_hash),
                peer_id: Id20::new(peer_id),
            },
            HANDSHAKE_LEN,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extended::handshake::ExtendedHandshake;

    fn no_peer_ids() -> PeerExtendedMessageIds {
        PeerExtendedMessageIds::default()
    }

    #[test]
    fn test_handshake_serialize() {
        let info_hash = Id20::new([
            1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
        ]);
        let peer_id = Id20::new([
            21u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
        ]);
        let mut buf = Vec::new();
        Handshake::new(info_hash, peer_id).serialize(&mut buf);
        assert_eq!(buf.len(), 20 + 20 + 8 + 19 + 1);

        let (h, consumed) = Handshake::deserialize(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(h.info_hash, info_hash);
        assert_eq!(h.peer_id, peer_id);
        assert!(h.supports_extended());
    }

    #[test]
    fn test_handshake_needs_more_data() {
        let mut buf = Vec::new();
        Handshake::new(Id20::default(), Id20::default()).serialize(&mut buf);
        let err = Handshake::deserialize(&buf[..10]).unwrap_err();
        assert!(err.is_not_enough_data());
    }

    fn roundtrip(msg: MessageOwned) {
        let mut buf = Vec::new();
        let len = msg.serialize(&mut buf, &no_peer_ids).unwrap();
        assert_eq!(len, buf.len());

        let (parsed, consumed) = MessageBorrowed::deserialize(&buf).unwrap();
        assert_eq!(consumed, len);
        assert_eq!(parsed.clone_to_owned(), msg);
    }

    #[test]
    fn test_roundtrip_fixed_messages() {
        roundtrip(MessageOwned::Choke);
        roundtrip(MessageOwned::Unchoke);
        roundtrip(MessageOwned::Interested);
        roundtrip(MessageOwned::NotInterested);
        roundtrip(MessageOwned::KeepAlive);
        roundtrip(MessageOwned::Have(42));
        roundtrip(MessageOwned::Port(6881));
        roundtrip(MessageOwned::Request(Request::new(1, 16384, 16384)));
        roundtrip(MessageOwned::Cancel(Request::new(1, 16384, 16384)));
    }

    #[test]
    fn test_roundtrip_variable_messages() {
        roundtrip(MessageOwned::Bitfield(b"\x80\x01"[..].into()));
        roundtrip(MessageOwned::Piece(Piece::from_data(
            3,
            16384,
            &b"payload bytes"[..],
        )));
        roundtrip(MessageOwned::Extended(ExtendedMessage::Handshake(
            ExtendedHandshake::new(),
        )));
    }

    #[test]
    fn test_decode_stream_prefix_boundary() {
        // Two messages concatenated: decoding consumes exactly the
        // first, re-encoding the first yields the same prefix.
        let mut buf = Vec::new();
        MessageOwned::Have(7).serialize(&mut buf, &no_peer_ids).unwrap();
        let first_len = buf.len();
        let mut second = Vec::new();
        MessageOwned::Choke
            .serialize(&mut second, &no_peer_ids)
            .unwrap();
        buf.extend_from_slice(&second);

        let (msg, consumed) = MessageBorrowed::deserialize(&buf).unwrap();
        assert_eq!(consumed, first_len);
        assert_eq!(msg, MessageBorrowed::Have(7));

        let mut reencoded = Vec::new();
        msg.serialize(&mut reencoded, &no_peer_ids).unwrap();
        assert_eq!(&buf[..consumed], &reencoded[..]);

        let (msg, consumed2) = MessageBorrowed::deserialize(&buf[consumed..]).unwrap();
        assert_eq!(msg, MessageBorrowed::Choke);
        assert_eq!(consumed + consumed2, buf.len());
    }

    #[test]
    fn test_partial_input_consumes_nothing() {
        let mut buf = Vec::new();
        MessageOwned::Piece(Piece::from_data(0, 0, &[0u8; 64][..]))
            .serialize(&mut buf, &no_peer_ids)
            .unwrap();
        for cut in 0..buf.len() {
            let err = MessageBorrowed::deserialize(&buf[..cut]).unwrap_err();
            assert!(err.is_not_enough_data(), "cut={cut}, got {err:?}");
        }
    }

    #[test]
    fn test_unknown_message_id_is_protocol_error() {
        let buf = [0u8, 0, 0, 1, 17];
        let err = MessageBorrowed::deserialize(&buf).unwrap_err();
        assert!(matches!(
            err,
            MessageDeserializeError::UnsupportedMessageId(17)
        ));
    }
}
