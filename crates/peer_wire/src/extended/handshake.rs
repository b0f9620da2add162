use bencode::{BencodeValue, ByteBuf, CloneToOwned};

use crate::{MessageDeserializeError, MY_EXTENDED_UT_PEX};

/// The BEP-10 extended handshake dictionary.
///
/// The `m` map is additive: an extension, once advertised, cannot be
/// assumed disabled based on a later handshake that omits it. Keys we
/// don't understand are kept verbatim in `other` and echoed back when
/// the handshake is re-serialized.
#[derive(Debug, PartialEq, Eq)]
pub struct ExtendedHandshake<B> {
    pub m: Vec<(B, u8)>,
    pub p: Option<u32>,
    pub v: Option<B>,
    pub metadata_size: Option<u32>,
    pub e: Option<u8>,
    pub other: Vec<(B, BencodeValue<B>)>,
}

impl<B> Default for ExtendedHandshake<B> {
    fn default() -> Self {
        Self {
            m: Vec::new(),
            p: None,
            v: None,
            metadata_size: None,
            e: None,
            other: Vec::new(),
        }
    }
}

impl<B: AsRef<[u8]>> ExtendedHandshake<B> {
    pub fn new() -> Self
    where
        B: From<&'static [u8]>,
    {
        Self {
            m: vec![(B::from(&b"ut_pex"[..]), MY_EXTENDED_UT_PEX)],
            ..Default::default()
        }
    }

    pub fn get_msgid(&self, msg_type: &[u8]) -> Option<u8> {
        self.m.iter().find_map(|(k, v)| {
            if k.as_ref() == msg_type {
                Some(*v)
            } else {
                None
            }
        })
    }

    pub fn ut_pex(&self) -> Option<u8> {
        self.get_msgid(b"ut_pex")
    }

    pub fn port(&self) -> Option<u16> {
        self.p.and_then(|p| u16::try_from(p).ok())
    }

    pub fn to_bencode(&self) -> BencodeValue<ByteBuf<'_>> {
        let mut dict: Vec<(ByteBuf, BencodeValue<ByteBuf>)> = Vec::new();
        dict.push((
            ByteBuf(b"m"),
            BencodeValue::Dict(
                self.m
                    .iter()
                    .map(|(k, v)| (ByteBuf(k.as_ref()), BencodeValue::Integer(*v as i64)))
                    .collect(),
            ),
        ));
        if let Some(p) = self.p {
            dict.push((ByteBuf(b"p"), BencodeValue::Integer(p as i64)));
        }
        if let Some(v) = &self.v {
            dict.push((ByteBuf(b"v"), BencodeValue::Bytes(ByteBuf(v.as_ref()))));
        }
        if let Some(ms) = self.metadata_size {
            dict.push((
                ByteBuf(b"metadata_size"),
                BencodeValue::Integer(ms as i64),
            ));
        }
        if let Some(e) = self.e {
            dict.push((ByteBuf(b"e"), BencodeValue::Integer(e as i64)));
        }
        for (k, v) in &self.other {
            dict.push((ByteBuf(k.as_ref()), v.as_borrowed()));
        }
        BencodeValue::Dict(dict)
    }

    pub fn from_value(value: BencodeValue<B>) -> Result<Self, MessageDeserializeError> {
        let entries = match value {
            BencodeValue::Dict(d) => d,
            _ => {
                return Err(MessageDeserializeError::Other(anyhow::anyhow!(
                    "extended handshake is not a dict"
                )))
            }
        };
        let mut h = Self::default();
        for (key, value) in entries {
            match key.as_ref() {
                b"m" => {
                    let m = match value {
                        BencodeValue::Dict(m) => m,
                        _ => {
                            return Err(MessageDeserializeError::Other(anyhow::anyhow!(
                                "extended handshake \"m\" is not a dict"
                            )))
                        }
                    };
                    for (name, id) in m {
                        let id = id.as_int().ok_or_else(|| {
                            anyhow::anyhow!("extension id for {:?} is not an integer", name.as_ref())
                        })?;
                        let id = u8::try_from(id)
                            .map_err(|_| anyhow::anyhow!("extension id {} out of range", id))?;
                        h.m.push((name, id));
                    }
                }
                b"p" => h.p = value.as_int().and_then(|p| u32::try_from(p).ok()),
                b"v" => {
                    if let BencodeValue::Bytes(b) = value {
                        h.v = Some(b);
                    }
                }
                b"metadata_size" => {
                    h.metadata_size = value.as_int().and_then(|s| u32::try_from(s).ok())
                }
                b"e" => h.e = value.as_int().and_then(|e| u8::try_from(e).ok()),
                _ => h.other.push((key, value)),
            }
        }
        Ok(h)
    }
}

impl<B> CloneToOwned for ExtendedHandshake<B>
where
    B: CloneToOwned,
{
    type Target = ExtendedHandshake<<B as CloneToOwned>::Target>;

    fn clone_to_owned(&self) -> Self::Target {
        ExtendedHandshake {
            m: self
                .m
                .iter()
                .map(|(k, v)| (k.clone_to_owned(), *v))
                .collect(),
            p: self.p,
            v: self.v.clone_to_owned(),
            metadata_size: self.metadata_size,
            e: self.e,
            other: self.other.clone_to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bencode::{bencode_serialize_to_writer, from_bytes};

    #[test]
    fn test_unknown_keys_are_echoed() {
        let input = b"d12:complete_agoi42e1:ei1e1:md6:ut_pexi1ee1:pi6881e4:reqqi250ee";
        let value: BencodeValue<ByteBuf> = from_bytes(&input[..]).unwrap();
        let h = ExtendedHandshake::from_value(value).unwrap();
        assert_eq!(h.ut_pex(), Some(1));
        assert_eq!(h.port(), Some(6881));
        assert_eq!(h.e, Some(1));
        assert_eq!(h.other.len(), 2);

        let mut out = Vec::new();
        bencode_serialize_to_writer(&h.to_bencode(), &mut out).unwrap();
        assert_eq!(&out[..], &input[..]);
    }

    #[test]
    fn test_default_handshake_advertises_ut_pex() {
        let h: ExtendedHandshake<ByteBuf> = ExtendedHandshake::new();
        assert_eq!(h.ut_pex(), Some(MY_EXTENDED_UT_PEX));
    }
}
