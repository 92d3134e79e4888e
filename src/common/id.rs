//! Kademlia id of a peer or a lookup key, and the XOR metric between ids.
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use crate::{Error, Result};

/// The size of Kademlia ids in bytes.
pub const ID_SIZE: usize = 32;
/// The number of bits in a Kademlia id.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia id, the SHA-256 digest of a peer id or of a content key.
pub struct KadId(pub [u8; ID_SIZE]);

impl KadId {
    pub fn random() -> KadId {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        KadId(random_bytes)
    }

    /// Create a new KadId from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<KadId> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(KadId(tmp))
    }

    /// Derive the KadId of arbitrary bytes (a peer id or a record key).
    pub fn digest(data: &[u8]) -> KadId {
        let mut hasher = Sha256::new();
        hasher.update(data);

        KadId(hasher.finalize().into())
    }

    /// XOR distance between this id and `other`.
    ///
    /// Distance to self is [Distance::ZERO].
    pub fn distance(&self, other: &KadId) -> Distance {
        let mut xor = [0_u8; ID_SIZE];

        for (i, byte) in xor.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(xor)
    }

    /// Returns the bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        let byte = self.0[index / 8];

        byte & (0x80 >> (index % 8)) != 0
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for KadId {
    fn from(bytes: [u8; ID_SIZE]) -> KadId {
        KadId(bytes)
    }
}

impl Display for KadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for KadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "KadId({})", self)
    }
}

impl FromStr for KadId {
    type Err = Error;

    fn from_str(s: &str) -> Result<KadId> {
        if s.len() % 2 != 0 {
            return Err(Error::InvalidIdSize(s.len() / 2));
        }

        let bytes = s
            .as_bytes()
            .chunks(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            })
            .collect::<Option<Vec<u8>>>()
            .ok_or(Error::InvalidIdSize(s.len() / 2))?;

        KadId::from_bytes(bytes)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// `a XOR b` read as a big-endian unsigned 256-bit integer.
///
/// Only meaningful for ordering; byte-wise lexicographic order equals
/// numeric order.
pub struct Distance([u8; ID_SIZE]);

impl Distance {
    pub const ZERO: Distance = Distance([0; ID_SIZE]);

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Number of leading zero bits, i.e. the common prefix length of both ids.
    pub fn leading_zeros(&self) -> usize {
        let mut zeros = 0;

        for byte in self.0 {
            if byte == 0 {
                zeros += 8;
            } else {
                return zeros + byte.leading_zeros() as usize;
            }
        }

        zeros
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", KadId(self.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_is_symmetric() {
        for _ in 0..100 {
            let a = KadId::random();
            let b = KadId::random();

            assert_eq!(a.distance(&b), b.distance(&a));
        }
    }

    #[test]
    fn distance_to_self_is_zero() {
        let id = KadId::random();

        assert_eq!(id.distance(&id), Distance::ZERO);
        assert_eq!(id.distance(&id).leading_zeros(), ID_BITS);
    }

    #[test]
    fn distance_orders_numerically() {
        let origin = KadId([0; ID_SIZE]);

        let mut near = [0; ID_SIZE];
        near[ID_SIZE - 1] = 0xff;
        let mut far = [0; ID_SIZE];
        far[0] = 0x01;

        assert!(origin.distance(&KadId(near)) < origin.distance(&KadId(far)));
        assert_eq!(origin.distance(&KadId(far)).leading_zeros(), 7);
    }

    #[test]
    fn wrong_size_is_rejected() {
        assert_eq!(KadId::from_bytes([0; 20]), Err(Error::InvalidIdSize(20)));
        assert_eq!(KadId::from_bytes([0; 33]), Err(Error::InvalidIdSize(33)));
        assert!(KadId::from_bytes([0; ID_SIZE]).is_ok());
    }

    #[test]
    fn bits_from_most_significant() {
        let mut bytes = [0; ID_SIZE];
        bytes[0] = 0b1010_0000;
        let id = KadId(bytes);

        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(id.bit(2));
        assert!(!id.bit(255));
    }

    #[test]
    fn hex_roundtrip() {
        let id = KadId::digest(b"hello");
        let parsed = KadId::from_str(&id.to_string()).unwrap();

        assert_eq!(parsed, id);
        assert!(KadId::from_str("abcd").is_err());
    }
}
