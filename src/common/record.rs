//! Value records stored in the DHT.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
/// A key-value record.
///
/// Immutable once created; an update replaces the whole record.
pub struct DhtRecord {
    key: Bytes,
    value: Bytes,
    time_received: Option<SystemTime>,
}

impl DhtRecord {
    /// Create a record received (or created) now.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            time_received: Some(SystemTime::now()),
        }
    }

    /// Create a record without a `time_received`, as sent over the wire by some peers.
    pub fn unstamped(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            time_received: None,
        }
    }

    /// Returns a copy of this record received at `time`.
    pub fn received_at(&self, time: SystemTime) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            time_received: Some(time),
        }
    }

    // === Getters ===

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn time_received(&self) -> Option<SystemTime> {
        self.time_received
    }

    /// How long ago this record was received, or `None` if it was never stamped.
    pub fn age(&self) -> Option<Duration> {
        self.time_received
            .map(|time| SystemTime::now().duration_since(time).unwrap_or_default())
    }

    // === Codec ===

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let encoded = EncodedRecord {
            key: self.key.to_vec(),
            value: self.value.to_vec(),
            time_received: self.time_received.map(|time| {
                time.duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64
            }),
        };

        Ok(serde_bencode::to_bytes(&encoded)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let encoded: EncodedRecord = serde_bencode::from_bytes(bytes)?;

        Ok(Self {
            key: encoded.key.into(),
            value: encoded.value.into(),
            time_received: encoded
                .time_received
                .map(|millis| UNIX_EPOCH + Duration::from_millis(millis)),
        })
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct EncodedRecord {
    #[serde(rename = "k", with = "serde_bytes")]
    key: Vec<u8>,

    #[serde(rename = "v", with = "serde_bytes")]
    value: Vec<u8>,

    #[serde(default)]
    #[serde(rename = "t", skip_serializing_if = "Option::is_none")]
    time_received: Option<u64>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codec_keeps_timestamp_millis() {
        let time = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        let record = DhtRecord::new(&b"/v/hello"[..], &b"world"[..]).received_at(time);

        let decoded = DhtRecord::deserialize(&record.serialize().unwrap()).unwrap();

        assert_eq!(decoded, record);
    }

    #[test]
    fn codec_without_timestamp() {
        let record = DhtRecord::unstamped(&b"hello"[..], &b"world"[..]);

        let decoded = DhtRecord::deserialize(&record.serialize().unwrap()).unwrap();

        assert_eq!(decoded.time_received(), None);
        assert_eq!(decoded.value().as_ref(), b"world");
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            DhtRecord::deserialize(b"not bencode"),
            Err(crate::Error::Decode(_))
        ));
    }
}
