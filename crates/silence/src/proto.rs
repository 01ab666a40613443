//! Snapshot and gossip records for silences.
//!
//! Same layout as the notification log's persistence: a sequence of
//! length-delimited protobuf records, shared between the snapshot file
//! and gossip payloads.

use bytes::Buf;
use chrono::DateTime;
use prost::Message;

use klaxon_core::{MatchOperator, Matcher, Matchers, ValidationError};

use crate::error::SilenceError;
use crate::types::Silence;

/// Matcher operator codes on the wire.
const OP_EQUAL: i32 = 0;
const OP_NOT_EQUAL: i32 = 1;
const OP_REGEX: i32 = 2;
const OP_NOT_REGEX: i32 = 3;

/// One matcher on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct MatcherRecord {
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(string, tag = "2")]
    pub pattern: String,

    #[prost(int32, tag = "3")]
    pub op: i32,
}

/// One silence on the wire. Timestamps are unix milliseconds.
#[derive(Clone, PartialEq, Message)]
pub struct SilenceRecord {
    #[prost(string, tag = "1")]
    pub id: String,

    #[prost(message, repeated, tag = "2")]
    pub matchers: Vec<MatcherRecord>,

    #[prost(int64, tag = "3")]
    pub starts_at_ms: i64,

    #[prost(int64, tag = "4")]
    pub ends_at_ms: i64,

    #[prost(string, tag = "5")]
    pub created_by: String,

    #[prost(string, tag = "6")]
    pub comment: String,

    #[prost(int64, tag = "7")]
    pub updated_at_ms: i64,
}

impl From<&Silence> for SilenceRecord {
    fn from(sil: &Silence) -> Self {
        Self {
            id: sil.id.clone(),
            matchers: sil
                .matchers
                .iter()
                .map(|m| MatcherRecord {
                    name: m.name().to_owned(),
                    pattern: m.value().to_owned(),
                    op: match m.op() {
                        MatchOperator::Equal => OP_EQUAL,
                        MatchOperator::NotEqual => OP_NOT_EQUAL,
                        MatchOperator::Regex => OP_REGEX,
                        MatchOperator::NotRegex => OP_NOT_REGEX,
                    },
                })
                .collect(),
            starts_at_ms: sil.starts_at.timestamp_millis(),
            ends_at_ms: sil.ends_at.timestamp_millis(),
            created_by: sil.created_by.clone(),
            comment: sil.comment.clone(),
            updated_at_ms: sil.updated_at.timestamp_millis(),
        }
    }
}

impl TryFrom<SilenceRecord> for Silence {
    type Error = ValidationError;

    fn try_from(rec: SilenceRecord) -> Result<Self, Self::Error> {
        let matchers: Matchers = rec
            .matchers
            .into_iter()
            .map(|m| {
                let op = match m.op {
                    OP_NOT_EQUAL => MatchOperator::NotEqual,
                    OP_REGEX => MatchOperator::Regex,
                    OP_NOT_REGEX => MatchOperator::NotRegex,
                    _ => MatchOperator::Equal,
                };
                Matcher::new(m.name, op, m.pattern)
            })
            .collect::<Result<Vec<Matcher>, ValidationError>>()?
            .into_iter()
            .collect();

        Ok(Silence {
            id: rec.id,
            matchers,
            starts_at: DateTime::from_timestamp_millis(rec.starts_at_ms)
                .unwrap_or(DateTime::UNIX_EPOCH),
            ends_at: DateTime::from_timestamp_millis(rec.ends_at_ms)
                .unwrap_or(DateTime::UNIX_EPOCH),
            created_by: rec.created_by,
            comment: rec.comment,
            updated_at: DateTime::from_timestamp_millis(rec.updated_at_ms)
                .unwrap_or(DateTime::UNIX_EPOCH),
        })
    }
}

/// Encoded size of a silence record, used by the per-silence size limit.
#[must_use]
pub fn encoded_len(sil: &Silence) -> usize {
    SilenceRecord::from(sil).encoded_len()
}

/// Encode silences as a length-delimited batch.
pub fn encode_batch<'a>(silences: impl IntoIterator<Item = &'a Silence>) -> Vec<u8> {
    let mut buf = Vec::new();
    for sil in silences {
        SilenceRecord::from(sil)
            .encode_length_delimited(&mut buf)
            .expect("encoding into a Vec cannot fail");
    }
    buf
}

/// Decode a length-delimited batch.
///
/// Undecodable tails and records that fail matcher reconstruction (for
/// example a regex this build rejects) are dropped; everything valid is
/// returned along with the first error encountered.
pub fn decode_batch(mut buf: &[u8]) -> (Vec<Silence>, Option<SilenceError>) {
    let mut silences = Vec::new();
    let mut first_err = None;
    while buf.has_remaining() {
        match SilenceRecord::decode_length_delimited(&mut buf) {
            Ok(rec) => match Silence::try_from(rec) {
                Ok(sil) => silences.push(sil),
                Err(err) => {
                    first_err.get_or_insert(SilenceError::Validation(err));
                }
            },
            Err(err) => {
                first_err.get_or_insert(err.into());
                break;
            }
        }
    }
    (silences, first_err)
}
