//! Wire and snapshot records.
//!
//! Both the snapshot files and the gossip payloads are the same format: a
//! sequence of length-delimited protobuf [`Entry`] records.

use bytes::Buf;
use chrono::{DateTime, Utc};
use prost::Message;

use crate::error::NflogError;

/// One notification-log record.
///
/// Timestamps are unix milliseconds. For a given (group key, receiver)
/// the entry with the larger `timestamp_ms` wins on merge.
#[derive(Clone, PartialEq, Message)]
pub struct Entry {
    /// Identifies the (route, group labels) pair the notification was for.
    #[prost(string, tag = "1")]
    pub group_key: String,

    /// Receiver the notification went to.
    #[prost(string, tag = "2")]
    pub receiver: String,

    /// Stable hash over the delivered alert set and its firing/resolved
    /// split.
    #[prost(uint64, tag = "3")]
    pub group_hash: u64,

    /// Whether the delivered group contained no firing alerts.
    #[prost(bool, tag = "4")]
    pub resolved: bool,

    /// When the notification was sent.
    #[prost(int64, tag = "5")]
    pub timestamp_ms: i64,

    /// When this record may be dropped and must no longer be merged.
    #[prost(int64, tag = "6")]
    pub expires_at_ms: i64,
}

impl Entry {
    /// The send time as a UTC timestamp.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_ms).unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// The expiry as a UTC timestamp.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.expires_at_ms).unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Whether the record is past its expiry at `now`.
    #[must_use]
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }
}

/// Encode records as a length-delimited batch.
pub fn encode_batch<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Vec<u8> {
    let mut buf = Vec::new();
    for entry in entries {
        entry
            .encode_length_delimited(&mut buf)
            .expect("encoding into a Vec cannot fail");
    }
    buf
}

/// Decode a length-delimited batch, returning the records read.
///
/// A truncated or undecodable tail yields the records decoded so far
/// together with the error, so a corrupt snapshot degrades to partial
/// state instead of none.
pub fn decode_batch(mut buf: &[u8]) -> (Vec<Entry>, Option<NflogError>) {
    let mut entries = Vec::new();
    while buf.has_remaining() {
        match Entry::decode_length_delimited(&mut buf) {
            Ok(entry) => entries.push(entry),
            Err(err) => return (entries, Some(err.into())),
        }
    }
    (entries, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(receiver: &str, ts: i64) -> Entry {
        Entry {
            group_key: "{}/{service=\"api\"}".to_owned(),
            receiver: receiver.to_owned(),
            group_hash: 0xdead_beef,
            resolved: false,
            timestamp_ms: ts,
            expires_at_ms: ts + 3_600_000,
        }
    }

    #[test]
    fn batch_round_trip() {
        let entries = vec![entry("pager", 1000), entry("email", 2000)];
        let buf = encode_batch(&entries);
        let (back, err) = decode_batch(&buf);
        assert!(err.is_none());
        assert_eq!(back, entries);
    }

    #[test]
    fn empty_batch() {
        let (back, err) = decode_batch(&[]);
        assert!(back.is_empty());
        assert!(err.is_none());
    }

    #[test]
    fn truncated_batch_keeps_prefix() {
        let entries = vec![entry("pager", 1000), entry("email", 2000)];
        let buf = encode_batch(&entries);
        let (back, err) = decode_batch(&buf[..buf.len() - 3]);
        assert_eq!(back.len(), 1);
        assert!(err.is_some());
    }

    #[test]
    fn timestamp_conversion() {
        let e = entry("pager", 1_700_000_000_000);
        assert_eq!(e.timestamp().timestamp_millis(), 1_700_000_000_000);
        assert!(!e.expired_at(e.timestamp()));
        assert!(e.expired_at(e.expires_at()));
    }
}
