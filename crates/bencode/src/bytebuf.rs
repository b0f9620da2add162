// Byte buffer helpers that let protocol types be generic over borrowed
// (&[u8], zero-copy while decoding) and owned (Bytes, when a message is
// queued past the lifetime of its read buffer) data.

use std::borrow::Borrow;

use bytes::Bytes;

/// Borrowed-to-owned conversion that also changes the type, recursively.
/// `HashMap<ByteBuf, u8>` becomes `HashMap<ByteBufOwned, u8>` in one call.
pub trait CloneToOwned {
    type Target;

    fn clone_to_owned(&self) -> Self::Target;
}

impl<T> CloneToOwned for Option<T>
where
    T: CloneToOwned,
{
    type Target = Option<<T as CloneToOwned>::Target>;

    fn clone_to_owned(&self) -> Self::Target {
        self.as_ref().map(|i| i.clone_to_owned())
    }
}

impl<T> CloneToOwned for Vec<T>
where
    T: CloneToOwned,
{
    type Target = Vec<<T as CloneToOwned>::Target>;

    fn clone_to_owned(&self) -> Self::Target {
        self.iter().map(|i| i.clone_to_owned()).collect()
    }
}

impl<A, B> CloneToOwned for (A, B)
where
    A: CloneToOwned,
    B: CloneToOwned,
{
    type Target = (<A as CloneToOwned>::Target, <B as CloneToOwned>::Target);

    fn clone_to_owned(&self) -> Self::Target {
        (self.0.clone_to_owned(), self.1.clone_to_owned())
    }
}

impl CloneToOwned for u8 {
    type Target = u8;

    fn clone_to_owned(&self) -> Self::Target {
        *self
    }
}

impl CloneToOwned for u32 {
    type Target = u32;

    fn clone_to_owned(&self) -> Self::Target {
        *self
    }
}

#[derive(Default, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct ByteBufOwned(pub Bytes);

#[derive(Default, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct ByteBuf<'a>(pub &'a [u8]);

pub trait ByteBufT:
    AsRef<[u8]> + Default + std::hash::Hash + Eq + core::fmt::Debug + CloneToOwned + Borrow<[u8]>
{
}

impl ByteBufT for ByteBufOwned {}

impl ByteBufT for ByteBuf<'_> {}

fn debug_bytes(b: &[u8], f: &mut std::fmt::Formatter<'_>, debug_strings: bool) -> std::fmt::Result {
    if b.is_empty() {
        return Ok(());
    }
    if b.iter().all(|b| *b == 0) {
        return write!(f, "<{} bytes, all zeroes>", b.len());
    }
    if let Ok(s) = std::str::from_utf8(b) {
        if debug_strings {
            return write!(f, "{s:?}");
        } else {
            return write!(f, "{s}");
        }
    }

    // up to 20 bytes, display hex
    if b.len() <= 20 {
        write!(f, "<{} bytes, 0x", b.len())?;
        for byte in b {
            write!(f, "{byte:02x?}")?;
        }
        return write!(f, ">");
    }

    write!(f, "<{} bytes>", b.len())
}

impl std::fmt::Debug for ByteBuf<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        debug_bytes(self.0, f, true)
    }
}

impl std::fmt::Display for ByteBuf<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        debug_bytes(self.0, f, false)
    }
}

impl std::fmt::Debug for ByteBufOwned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        debug_bytes(&self.0, f, true)
    }
}

impl std::fmt::Display for ByteBufOwned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        debug_bytes(&self.0, f, false)
    }
}

impl CloneToOwned for ByteBuf<'_> {
    type Target = ByteBufOwned;

    fn clone_to_owned(&self) -> Self::Target {
        ByteBufOwned(Bytes::copy_from_slice(self.0))
    }
}

impl CloneToOwned for ByteBufOwned {
    type Target = ByteBufOwned;

    fn clone_to_owned(&self) -> Self::Target {
        ByteBufOwned(self.0.clone())
    }
}

impl std::convert::AsRef<[u8]> for ByteBuf<'_> {
    fn as_ref(&self) -> &[u8] {
        self.0
    }
}

impl std::convert::AsRef<[u8]> for ByteBufOwned {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::borrow::Borrow<[u8]> for ByteBufOwned {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl std::borrow::Borrow<[u8]> for ByteBuf<'_> {
    fn borrow(&self) -> &[u8] {
        self.0
    }
}

impl<'a> From<&'a [u8]> for ByteBuf<'a> {
    fn from(b: &'a [u8]) -> Self {
        Self(b)
    }
}

impl From<&[u8]> for ByteBufOwned {
    fn from(b: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for ByteBufOwned {
    fn from(b: Vec<u8>) -> Self {
        Self(b.into())
    }
}

impl From<Bytes> for ByteBufOwned {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl serde::ser::Serialize for ByteBuf<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(self.as_ref())
    }
}

impl serde::ser::Serialize for ByteBufOwned {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(self.as_ref())
    }
}
