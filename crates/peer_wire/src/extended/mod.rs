use bencode::{bencode_serialize_to_writer, BencodeValue, CloneToOwned};

use crate::{MessageDeserializeError, MY_EXTENDED_UT_PEX};

use self::{handshake::ExtendedHandshake, pex::UtPex};

pub mod handshake;
pub mod pex;

/// Extension ids the peer advertised in its extended handshake. Needed
/// to address outgoing extension messages, since the subtype byte is
/// whatever the *receiver* chose for that extension.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PeerExtendedMessageIds {
    pub ut_pex: Option<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExtendedMessage<B: AsRef<[u8]>> {
    Handshake(ExtendedHandshake<B>),
    UtPex(UtPex<B>),
    Dyn(u8, BencodeValue<B>),
}

impl<B: AsRef<[u8]>> ExtendedMessage<B> {
    pub fn serialize(
        &self,
        out: &mut Vec<u8>,
        peer_extended_msg_ids: &dyn Fn() -> PeerExtendedMessageIds,
    ) -> anyhow::Result<()> {
        match self {
            ExtendedMessage::Dyn(msg_id, v) => {
                out.push(*msg_id);
                bencode_serialize_to_writer(v, out)?;
            }
            ExtendedMessage::Handshake(h) => {
                out.push(0);
                bencode_serialize_to_writer(&h.to_bencode(), out)?;
            }
            ExtendedMessage::UtPex(m) => {
                let emsg_id = peer_extended_msg_ids().ut_pex.ok_or_else(|| {
                    anyhow::anyhow!("need peer's handshake to serialize ut_pex, or peer doesn't support ut_pex")
                })?;
                out.push(emsg_id);
                bencode_serialize_to_writer(&m.to_bencode(), out)?;
            }
        }
        Ok(())
    }

    pub fn deserialize<'a>(buf: &'a [u8]) -> Result<Self, MessageDeserializeError>
    where
        B: From<&'a [u8]>,
    {
        let emsg_id = *buf
            .first()
            .ok_or(MessageDeserializeError::NotEnoughData(1, "extended"))?;
        let value: BencodeValue<B> = bencode::from_bytes(&buf[1..])?;

        match emsg_id {
            0 => Ok(ExtendedMessage::Handshake(ExtendedHandshake::from_value(
                value,
            )?)),
            MY_EXTENDED_UT_PEX => Ok(ExtendedMessage::UtPex(UtPex::from_value(value)?)),
            _ => Ok(ExtendedMessage::Dyn(emsg_id, value)),
        }
    }
}

impl<B> CloneToOwned for ExtendedMessage<B>
where
    B: AsRef<[u8]> + CloneToOwned,
    <B as CloneToOwned>::Target: AsRef<[u8]>,
{
    type Target = ExtendedMessage<<B as CloneToOwned>::Target>;

    fn clone_to_owned(&self) -> Self::Target {
        match self {
            ExtendedMessage::Handshake(h) => ExtendedMessage::Handshake(h.clone_to_owned()),
            ExtendedMessage::UtPex(m) => ExtendedMessage::UtPex(m.clone_to_owned()),
            ExtendedMessage::Dyn(id, v) => ExtendedMessage::Dyn(*id, v.clone_to_owned()),
        }
    }
}
