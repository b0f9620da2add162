mod bytebuf;
mod value;

pub use bytebuf::{ByteBuf, ByteBufOwned, ByteBufT, CloneToOwned};
pub use value::{
    bencode_serialize_to_writer, from_bytes, from_bytes_with_rest, BencodeValue,
    BencodeValueBorrowed, BencodeValueOwned, Error,
};
