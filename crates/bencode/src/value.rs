use crate::bytebuf::{ByteBuf, ByteBufOwned, CloneToOwned};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of input")]
    Eof,
    #[error("invalid byte {0:#x} at offset {1}")]
    InvalidByte(u8, usize),
    #[error("invalid integer")]
    InvalidInt,
    #[error("byte string length too large")]
    LengthTooLarge,
    #[error("dict key is not a byte string")]
    NonStringDictKey,
}

/// A dynamically-typed bencode value. Dicts keep their entries in
/// encounter order so that unknown keys survive a decode/encode round
/// trip; the serializer emits keys in canonical (sorted) order.
#[derive(PartialEq, Eq)]
pub enum BencodeValue<B> {
    Bytes(B),
    Integer(i64),
    List(Vec<BencodeValue<B>>),
    Dict(Vec<(B, BencodeValue<B>)>),
}

pub type BencodeValueBorrowed<'a> = BencodeValue<ByteBuf<'a>>;
pub type BencodeValueOwned = BencodeValue<ByteBufOwned>;

impl<B: std::fmt::Debug> std::fmt::Debug for BencodeValue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BencodeValue::Bytes(b) => std::fmt::Debug::fmt(b, f),
            BencodeValue::Integer(i) => std::fmt::Debug::fmt(i, f),
            BencodeValue::List(l) => std::fmt::Debug::fmt(l, f),
            BencodeValue::Dict(d) => f.debug_map().entries(d.iter().map(|(k, v)| (k, v))).finish(),
        }
    }
}

impl<B> CloneToOwned for BencodeValue<B>
where
    B: CloneToOwned,
{
    type Target = BencodeValue<<B as CloneToOwned>::Target>;

    fn clone_to_owned(&self) -> Self::Target {
        match self {
            BencodeValue::Bytes(b) => BencodeValue::Bytes(b.clone_to_owned()),
            BencodeValue::Integer(i) => BencodeValue::Integer(*i),
            BencodeValue::List(l) => BencodeValue::List(l.clone_to_owned()),
            BencodeValue::Dict(d) => BencodeValue::Dict(d.clone_to_owned()),
        }
    }
}

impl<B: AsRef<[u8]>> BencodeValue<B> {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b.as_ref()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(B, BencodeValue<B>)]> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue<B>]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn dict_get(&self, key: &[u8]) -> Option<&BencodeValue<B>> {
        self.as_dict()?
            .iter()
            .find_map(|(k, v)| if k.as_ref() == key { Some(v) } else { None })
    }

    /// A view of this value borrowing the byte buffers, whatever the
    /// backing buffer type is.
    pub fn as_borrowed(&self) -> BencodeValue<ByteBuf<'_>> {
        match self {
            BencodeValue::Bytes(b) => BencodeValue::Bytes(ByteBuf(b.as_ref())),
            BencodeValue::Integer(i) => BencodeValue::Integer(*i),
            BencodeValue::List(l) => {
                BencodeValue::List(l.iter().map(|v| v.as_borrowed()).collect())
            }
            BencodeValue::Dict(d) => BencodeValue::Dict(
                d.iter()
                    .map(|(k, v)| (ByteBuf(k.as_ref()), v.as_borrowed()))
                    .collect(),
            ),
        }
    }
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, Error> {
        self.buf.get(self.pos).copied().ok_or(Error::Eof)
    }

    fn advance(&mut self) -> Result<u8, Error> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, byte: u8) -> Result<(), Error> {
        let b = self.advance()?;
        if b != byte {
            return Err(Error::InvalidByte(b, self.pos - 1));
        }
        Ok(())
    }

    // The digits up to (not including) the terminator. Used both for
    // "i...e" integers and for the "<len>:" prefix of byte strings.
    fn parse_number(&mut self, terminator: u8) -> Result<i64, Error> {
        let start = self.pos;
        let mut value: i64 = 0;
        let negative = if self.peek()? == b'-' {
            self.pos += 1;
            true
        } else {
            false
        };
        loop {
            let b = self.advance()?;
            if b == terminator {
                if self.pos == start + 1 + (negative as usize) {
                    return Err(Error::InvalidInt);
                }
                break;
            }
            if !b.is_ascii_digit() {
                return Err(Error::InvalidByte(b, self.pos - 1));
            }
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((b - b'0') as i64))
                .ok_or(Error::InvalidInt)?;
        }
        Ok(if negative { -value } else { value })
    }

    fn parse_bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = self.parse_number(b':')?;
        let len: usize = len.try_into().map_err(|_| Error::InvalidInt)?;
        let end = self.pos.checked_add(len).ok_or(Error::LengthTooLarge)?;
        let slice = self.buf.get(self.pos..end).ok_or(Error::Eof)?;
        self.pos = end;
        Ok(slice)
    }

    fn parse_value<B: From<&'a [u8]>>(&mut self) -> Result<BencodeValue<B>, Error> {
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                Ok(BencodeValue::Integer(self.parse_number(b'e')?))
            }
            b'l' => {
                self.pos += 1;
                let mut list = Vec::new();
                while self.peek()? != b'e' {
                    list.push(self.parse_value()?);
                }
                self.pos += 1;
                Ok(BencodeValue::List(list))
            }
            b'd' => {
                self.pos += 1;
                let mut dict = Vec::new();
                while self.peek()? != b'e' {
                    if !self.peek()?.is_ascii_digit() {
                        return Err(Error::NonStringDictKey);
                    }
                    let key = self.parse_bytes()?;
                    let value = self.parse_value()?;
                    dict.push((B::from(key), value));
                }
                self.pos += 1;
                Ok(BencodeValue::Dict(dict))
            }
            b if b.is_ascii_digit() => Ok(BencodeValue::Bytes(B::from(self.parse_bytes()?))),
            b => Err(Error::InvalidByte(b, self.pos)),
        }
    }
}

pub fn from_bytes_with_rest<'a, B: From<&'a [u8]>>(
    buf: &'a [u8],
) -> Result<(BencodeValue<B>, &'a [u8]), Error> {
    let mut parser = Parser { buf, pos: 0 };
    let value = parser.parse_value()?;
    Ok((value, &buf[parser.pos..]))
}

pub fn from_bytes<'a, B: From<&'a [u8]>>(buf: &'a [u8]) -> Result<BencodeValue<B>, Error> {
    let (value, rest) = from_bytes_with_rest(buf)?;
    if !rest.is_empty() {
        return Err(Error::InvalidByte(rest[0], buf.len() - rest.len()));
    }
    Ok(value)
}

pub fn bencode_serialize_to_writer<B: AsRef<[u8]>, W: std::io::Write>(
    value: &BencodeValue<B>,
    writer: &mut W,
) -> std::io::Result<()> {
    match value {
        BencodeValue::Bytes(b) => {
            let b = b.as_ref();
            write!(writer, "{}:", b.len())?;
            writer.write_all(b)?;
        }
        BencodeValue::Integer(i) => {
            write!(writer, "i{i}e")?;
        }
        BencodeValue::List(l) => {
            writer.write_all(b"l")?;
            for item in l {
                bencode_serialize_to_writer(item, writer)?;
            }
            writer.write_all(b"e")?;
        }
        BencodeValue::Dict(d) => {
            let mut keys: Vec<usize> = (0..d.len()).collect();
            keys.sort_by_key(|idx| d[*idx].0.as_ref());
            writer.write_all(b"d")?;
            for idx in keys {
                let (key, value) = &d[idx];
                let key = key.as_ref();
                write!(writer, "{}:", key.len())?;
                writer.write_all(key)?;
                bencode_serialize_to_writer(value, writer)?;
            }
            writer.write_all(b"e")?;
        }
    }
    Ok(())
}
