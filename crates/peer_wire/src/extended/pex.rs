use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bencode::{BencodeValue, ByteBuf, ByteBufOwned, CloneToOwned};
use byteorder::{ByteOrder, BE};

use crate::MessageDeserializeError;

/// ut_pex flag byte: peer supports protocol encryption.
pub const PEX_FLAG_ENCRYPTION: u8 = 0x01;
/// ut_pex flag byte: peer is a seed.
pub const PEX_FLAG_SEED: u8 = 0x02;

const V4_LEN: usize = 6;
const V6_LEN: usize = 18;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PexPeerInfo {
    pub flags: u8,
    pub addr: SocketAddr,
}

impl core::fmt::Debug for PexPeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)?;
        if self.flags != 0 {
            write!(f, ";flags={}", self.flags)?;
        }
        Ok(())
    }
}

/// The ut_pex message. Address lists are kept in their compact packed
/// form (6 bytes per IPv4 peer, 18 per IPv6 peer, one flag byte per
/// added peer) and unpacked lazily.
#[derive(Debug, PartialEq, Eq)]
pub struct UtPex<B> {
    pub added: Option<B>,
    pub added_f: Option<B>,
    pub added6: Option<B>,
    pub added6_f: Option<B>,
    pub dropped: Option<B>,
    pub dropped6: Option<B>,
}

impl<B> Default for UtPex<B> {
    fn default() -> Self {
        Self {
            added: None,
            added_f: None,
            added6: None,
            added6_f: None,
            dropped: None,
            dropped6: None,
        }
    }
}

fn unpack_v4(buf: &[u8]) -> SocketAddr {
    let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
    SocketAddr::V4(SocketAddrV4::new(ip, BE::read_u16(&buf[4..6])))
}

fn unpack_v6(buf: &[u8]) -> SocketAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buf[..16]);
    SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(octets),
        BE::read_u16(&buf[16..18]),
        0,
        0,
    ))
}

fn pack_addr(addr: SocketAddr, out: &mut Vec<u8>) {
    match addr {
        SocketAddr::V4(a) => {
            out.extend_from_slice(&a.ip().octets());
            out.extend_from_slice(&a.port().to_be_bytes());
        }
        SocketAddr::V6(a) => {
            out.extend_from_slice(&a.ip().octets());
            out.extend_from_slice(&a.port().to_be_bytes());
        }
    }
}

fn iter_packed<'a>(
    buf: Option<&'a [u8]>,
    flags: Option<&'a [u8]>,
    entry_len: usize,
    unpack: fn(&[u8]) -> SocketAddr,
) -> impl Iterator<Item = PexPeerInfo> + 'a {
    buf.into_iter()
        .flat_map(move |b| b.chunks_exact(entry_len))
        .enumerate()
        .map(move |(idx, chunk)| PexPeerInfo {
            flags: flags.and_then(|f| f.get(idx).copied()).unwrap_or(0),
            addr: unpack(chunk),
        })
}

impl<B: AsRef<[u8]>> UtPex<B> {
    fn slice(field: &Option<B>) -> Option<&[u8]> {
        field.as_ref().map(|b| b.as_ref())
    }

    pub fn added_peers(&self) -> impl Iterator<Item = PexPeerInfo> + '_ {
        iter_packed(
            Self::slice(&self.added),
            Self::slice(&self.added_f),
            V4_LEN,
            unpack_v4,
        )
        .chain(iter_packed(
            Self::slice(&self.added6),
            Self::slice(&self.added6_f),
            V6_LEN,
            unpack_v6,
        ))
    }

    pub fn dropped_peers(&self) -> impl Iterator<Item = PexPeerInfo> + '_ {
        iter_packed(Self::slice(&self.dropped), None, V4_LEN, unpack_v4).chain(iter_packed(
            Self::slice(&self.dropped6),
            None,
            V6_LEN,
            unpack_v6,
        ))
    }

    pub fn to_bencode(&self) -> BencodeValue<ByteBuf<'_>> {
        fn push<'a, B: AsRef<[u8]>>(
            dict: &mut Vec<(ByteBuf<'a>, BencodeValue<ByteBuf<'a>>)>,
            key: &'static [u8],
            value: &'a Option<B>,
        ) {
            if let Some(v) = value {
                dict.push((ByteBuf(key), BencodeValue::Bytes(ByteBuf(v.as_ref()))));
            }
        }
        let mut dict: Vec<(ByteBuf, BencodeValue<ByteBuf>)> = Vec::new();
        push(&mut dict, b"added", &self.added);
        push(&mut dict, b"added.f", &self.added_f);
        push(&mut dict, b"added6", &self.added6);
        push(&mut dict, b"added6.f", &self.added6_f);
        push(&mut dict, b"dropped", &self.dropped);
        push(&mut dict, b"dropped6", &self.dropped6);
        BencodeValue::Dict(dict)
    }

    pub fn from_value(value: BencodeValue<B>) -> Result<Self, MessageDeserializeError> {
        let entries = match value {
            BencodeValue::Dict(d) => d,
            _ => {
                return Err(MessageDeserializeError::Other(anyhow::anyhow!(
                    "ut_pex message is not a dict"
                )))
            }
        };
        let mut msg = Self::default();
        for (key, value) in entries {
            let bytes = match value {
                BencodeValue::Bytes(b) => b,
                // unknown or malformed entries are ignored
                _ => continue,
            };
            match key.as_ref() {
                b"added" => msg.added = Some(bytes),
                b"added.f" => msg.added_f = Some(bytes),
                b"added6" => msg.added6 = Some(bytes),
                b"added6.f" => msg.added6_f = Some(bytes),
                b"dropped" => msg.dropped = Some(bytes),
                b"dropped6" => msg.dropped6 = Some(bytes),
                _ => {}
            }
        }
        Ok(msg)
    }
}

impl UtPex<ByteBufOwned> {
    pub fn from_addrs(
        added: impl Iterator<Item = PexPeerInfo> + Clone,
        dropped: impl Iterator<Item = PexPeerInfo> + Clone,
    ) -> Self {
        fn split(
            addrs: impl Iterator<Item = PexPeerInfo> + Clone,
            with_flags: bool,
        ) -> (Option<ByteBufOwned>, Option<ByteBufOwned>, Option<ByteBufOwned>) {
            let mut v4 = Vec::new();
            let mut v4_flags = Vec::new();
            let mut v6 = Vec::new();
            for peer in addrs {
                match peer.addr.ip() {
                    IpAddr::V4(_) => {
                        pack_addr(peer.addr, &mut v4);
                        v4_flags.push(peer.flags);
                    }
                    IpAddr::V6(_) => pack_addr(peer.addr, &mut v6),
                }
            }
            let some_nonempty =
                |v: Vec<u8>| -> Option<ByteBufOwned> { (!v.is_empty()).then(|| v.into()) };
            (
                some_nonempty(v4),
                if with_flags {
                    some_nonempty(v4_flags)
                } else {
                    None
                },
                some_nonempty(v6),
            )
        }

        let (added_v4, added_f, added6) = split(added, true);
        let (dropped_v4, _, dropped6) = split(dropped, false);

        Self {
            added: added_v4,
            added_f,
            added6,
            added6_f: None,
            dropped: dropped_v4,
            dropped6,
        }
    }
}

impl<B> CloneToOwned for UtPex<B>
where
    B: CloneToOwned,
{
    type Target = UtPex<<B as CloneToOwned>::Target>;

    fn clone_to_owned(&self) -> Self::Target {
        UtPex {
            added: self.added.clone_to_owned(),
            added_f: self.added_f.clone_to_owned(),
            added6: self.added6.clone_to_owned(),
            added6_f: self.added6_f.clone_to_owned(),
            dropped: self.dropped.clone_to_owned(),
            dropped6: self.dropped6.clone_to_owned(),
        }
    }
}
