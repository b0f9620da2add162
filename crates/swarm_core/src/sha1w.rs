// Wrapper to be able to swap sha1 implementations without touching
// the hashing call sites. Piece verification is the bulk of CPU time.

pub type Sha1 = Sha1Rust;

pub trait ISha1 {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; 20];
}

pub struct Sha1Rust {
    inner: sha1::Sha1,
}

impl ISha1 for Sha1Rust {
    fn new() -> Self {
        use sha1::Digest;
        Self {
            inner: sha1::Sha1::new(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use sha1::Digest;
        self.inner.update(buf);
    }

    fn finish(self) -> [u8; 20] {
        use sha1::Digest;
        let mut result_arr = [0u8; 20];
        result_arr.copy_from_slice(self.inner.finalize().as_slice());
        result_arr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        let mut h = Sha1::new();
        h.update(b"abc");
        assert_eq!(
            hex::encode(h.finish()),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
