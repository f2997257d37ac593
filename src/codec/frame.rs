//! Transport-internal record kinds.
//!
//! Every core record starts with [`CORE_MARKER`] followed by a kind byte.
//! Anything else on the wire belongs to the application and is passed
//! through untouched.
//!
//! ```text
//! +--------+------+----------------------+---------------+
//! | 0x00   | kind | fixed fields (LE)    | tail          |
//! +--------+------+----------------------+---------------+
//! ```

use crate::core::constants::*;
use crate::core::{RecordError, RecordResult};

use super::record::{FieldSpec, Record, RecordSchema};

/// Record schemas for every core kind.
pub mod schemas {
    use super::*;

    macro_rules! core_schema {
        ($ident:ident, $name:literal, $kind:expr, [$($field:expr),* $(,)?]) => {
            #[doc = concat!("Wire shape of ", $name, ".")]
            pub static $ident: RecordSchema = RecordSchema {
                name: $name,
                prefix: &[CORE_MARKER],
                id: &[$kind],
                fields: &[$($field),*],
            };
        };
    }

    core_schema!(CONNECT, "Connect", KIND_CONNECT, [
        FieldSpec::signed("key", 4).with_default(-1),
        FieldSpec::unsigned("version", 2).with_default(VIE_VERSION as i64),
    ]);
    core_schema!(CONNECT_RESPONSE, "ConnectResponse", KIND_CONNECT_RESPONSE, [
        FieldSpec::signed("server_key", 4).with_default(-1),
    ]);
    core_schema!(RELIABLE, "Reliable", KIND_RELIABLE, [FieldSpec::unsigned("seq", 4)]);
    core_schema!(ACK, "Ack", KIND_ACK, [FieldSpec::unsigned("seq", 4)]);
    core_schema!(HEARTBEAT, "Heartbeat", KIND_HEARTBEAT, [
        FieldSpec::unsigned("sender_time", 4),
        FieldSpec::unsigned("sent_count", 4),
        FieldSpec::unsigned("recv_count", 4),
    ]);
    core_schema!(HEARTBEAT_RESPONSE, "HeartbeatResponse", KIND_HEARTBEAT_RESPONSE, [
        FieldSpec::unsigned("echoed_time", 4),
        FieldSpec::unsigned("sender_time", 4),
    ]);
    core_schema!(DISCONNECT, "Disconnect", KIND_DISCONNECT, []);
    core_schema!(FRAGMENT, "Fragment", KIND_FRAGMENT, []);
    core_schema!(FRAGMENT_TAIL, "FragmentTail", KIND_FRAGMENT_TAIL, []);
    core_schema!(STREAM_REQUEST, "StreamRequest", KIND_STREAM_REQUEST, [
        FieldSpec::unsigned("total_length", 4),
    ]);
    core_schema!(STREAM_CANCEL, "StreamCancel", KIND_STREAM_CANCEL, []);
    core_schema!(STREAM_CANCEL_ACK, "StreamCancelAck", KIND_STREAM_CANCEL_ACK, []);
    core_schema!(CLUSTER, "Cluster", KIND_CLUSTER, []);
}

/// Core record kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoreKind {
    /// Client key offer.
    Connect = KIND_CONNECT,
    /// Server key answer.
    ConnectResponse = KIND_CONNECT_RESPONSE,
    /// Sequenced envelope.
    Reliable = KIND_RELIABLE,
    /// Cumulative acknowledgement.
    Ack = KIND_ACK,
    /// Clock and counter probe.
    Heartbeat = KIND_HEARTBEAT,
    /// Probe answer.
    HeartbeatResponse = KIND_HEARTBEAT_RESPONSE,
    /// Session teardown.
    Disconnect = KIND_DISCONNECT,
    /// Non-final payload slice.
    Fragment = KIND_FRAGMENT,
    /// Final payload slice.
    FragmentTail = KIND_FRAGMENT_TAIL,
    /// Streamed transfer announcement.
    StreamRequest = KIND_STREAM_REQUEST,
    /// Streamed transfer abort.
    StreamCancel = KIND_STREAM_CANCEL,
    /// Abort confirmation.
    StreamCancelAck = KIND_STREAM_CANCEL_ACK,
    /// Batch of records.
    Cluster = KIND_CLUSTER,
}

impl CoreKind {
    /// Parse a kind byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            KIND_CONNECT => Some(Self::Connect),
            KIND_CONNECT_RESPONSE => Some(Self::ConnectResponse),
            KIND_RELIABLE => Some(Self::Reliable),
            KIND_ACK => Some(Self::Ack),
            KIND_HEARTBEAT => Some(Self::Heartbeat),
            KIND_HEARTBEAT_RESPONSE => Some(Self::HeartbeatResponse),
            KIND_DISCONNECT => Some(Self::Disconnect),
            KIND_FRAGMENT => Some(Self::Fragment),
            KIND_FRAGMENT_TAIL => Some(Self::FragmentTail),
            KIND_STREAM_REQUEST => Some(Self::StreamRequest),
            KIND_STREAM_CANCEL => Some(Self::StreamCancel),
            KIND_STREAM_CANCEL_ACK => Some(Self::StreamCancelAck),
            KIND_CLUSTER => Some(Self::Cluster),
            _ => None,
        }
    }

    /// Kind byte on the wire.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Schema used to decode this kind.
    pub fn schema(self) -> &'static RecordSchema {
        match self {
            Self::Connect => &schemas::CONNECT,
            Self::ConnectResponse => &schemas::CONNECT_RESPONSE,
            Self::Reliable => &schemas::RELIABLE,
            Self::Ack => &schemas::ACK,
            Self::Heartbeat => &schemas::HEARTBEAT,
            Self::HeartbeatResponse => &schemas::HEARTBEAT_RESPONSE,
            Self::Disconnect => &schemas::DISCONNECT,
            Self::Fragment => &schemas::FRAGMENT,
            Self::FragmentTail => &schemas::FRAGMENT_TAIL,
            Self::StreamRequest => &schemas::STREAM_REQUEST,
            Self::StreamCancel => &schemas::STREAM_CANCEL,
            Self::StreamCancelAck => &schemas::STREAM_CANCEL_ACK,
            Self::Cluster => &schemas::CLUSTER,
        }
    }

    /// Handshake records travel unencrypted in both directions.
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Connect | Self::ConnectResponse)
    }
}

/// Classify raw record bytes.
///
/// Returns `None` for application records and for unknown core kinds.
pub fn core_kind(bytes: &[u8]) -> Option<CoreKind> {
    match bytes {
        [CORE_MARKER, kind, ..] => CoreKind::from_byte(*kind),
        _ => None,
    }
}

/// Bytes left unencrypted at the start of a record.
pub fn clear_prefix(bytes: &[u8]) -> usize {
    match bytes.first() {
        Some(&CORE_MARKER) => CORE_CLEAR_PREFIX,
        _ => APP_CLEAR_PREFIX,
    }
}

/// A decoded transport-internal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreRecord {
    /// Client key offer.
    Connect {
        /// Client's session key.
        key: i32,
        /// Encryption protocol version.
        version: u16,
    },
    /// Server key answer.
    ConnectResponse {
        /// Key both sides derive the cipher from.
        server_key: i32,
    },
    /// Sequenced envelope around one inner record.
    Reliable {
        /// Sequence number.
        seq: u32,
        /// Encoded inner record.
        inner: Vec<u8>,
    },
    /// Acknowledges every envelope up to and including `seq`.
    Ack {
        /// Highest acknowledged sequence number.
        seq: u32,
    },
    /// Clock and counter probe.
    Heartbeat {
        /// Sender's clock in hundredths of a second.
        sender_time: u32,
        /// Datagrams sent so far.
        sent_count: u32,
        /// Datagrams received so far.
        recv_count: u32,
    },
    /// Probe answer.
    HeartbeatResponse {
        /// `sender_time` from the probe being answered.
        echoed_time: u32,
        /// Responder's clock.
        sender_time: u32,
    },
    /// Session teardown.
    Disconnect,
    /// Non-final payload slice.
    Fragment(Vec<u8>),
    /// Final payload slice.
    FragmentTail(Vec<u8>),
    /// Streamed transfer announcement.
    StreamRequest {
        /// Announced total size.
        total_length: u32,
        /// First bytes of the stream.
        data: Vec<u8>,
    },
    /// Streamed transfer abort.
    StreamCancel,
    /// Abort confirmation.
    StreamCancelAck,
    /// Concatenated `(length, record)` entries.
    Cluster(Vec<u8>),
}

impl CoreRecord {
    /// Decode a core record.
    ///
    /// Returns `Ok(None)` when `bytes` is not a known core record.
    pub fn parse(bytes: &[u8]) -> RecordResult<Option<Self>> {
        let Some(kind) = core_kind(bytes) else {
            return Ok(None);
        };
        let record = Record::decode(bytes, kind.schema())?;

        let parsed = match kind {
            CoreKind::Connect => Self::Connect {
                key: record.get("key")? as i32,
                version: record.get("version")? as u16,
            },
            CoreKind::ConnectResponse => Self::ConnectResponse {
                server_key: record.get("server_key")? as i32,
            },
            CoreKind::Reliable => Self::Reliable {
                seq: record.get("seq")? as u32,
                inner: record.into_tail(),
            },
            CoreKind::Ack => Self::Ack {
                seq: record.get("seq")? as u32,
            },
            CoreKind::Heartbeat => Self::Heartbeat {
                sender_time: record.get("sender_time")? as u32,
                sent_count: record.get("sent_count")? as u32,
                recv_count: record.get("recv_count")? as u32,
            },
            CoreKind::HeartbeatResponse => Self::HeartbeatResponse {
                echoed_time: record.get("echoed_time")? as u32,
                sender_time: record.get("sender_time")? as u32,
            },
            CoreKind::Disconnect => Self::Disconnect,
            CoreKind::Fragment => Self::Fragment(record.into_tail()),
            CoreKind::FragmentTail => Self::FragmentTail(record.into_tail()),
            CoreKind::StreamRequest => Self::StreamRequest {
                total_length: record.get("total_length")? as u32,
                data: record.into_tail(),
            },
            CoreKind::StreamCancel => Self::StreamCancel,
            CoreKind::StreamCancelAck => Self::StreamCancelAck,
            CoreKind::Cluster => Self::Cluster(record.into_tail()),
        };
        Ok(Some(parsed))
    }

    /// Kind of this record.
    pub fn kind(&self) -> CoreKind {
        match self {
            Self::Connect { .. } => CoreKind::Connect,
            Self::ConnectResponse { .. } => CoreKind::ConnectResponse,
            Self::Reliable { .. } => CoreKind::Reliable,
            Self::Ack { .. } => CoreKind::Ack,
            Self::Heartbeat { .. } => CoreKind::Heartbeat,
            Self::HeartbeatResponse { .. } => CoreKind::HeartbeatResponse,
            Self::Disconnect => CoreKind::Disconnect,
            Self::Fragment(_) => CoreKind::Fragment,
            Self::FragmentTail(_) => CoreKind::FragmentTail,
            Self::StreamRequest { .. } => CoreKind::StreamRequest,
            Self::StreamCancel => CoreKind::StreamCancel,
            Self::StreamCancelAck => CoreKind::StreamCancelAck,
            Self::Cluster(_) => CoreKind::Cluster,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let schema = self.kind().schema();
        let (values, tail) = match self {
            Self::Connect { key, version } => (vec![*key as i64, *version as i64], Vec::new()),
            Self::ConnectResponse { server_key } => (vec![*server_key as i64], Vec::new()),
            Self::Reliable { seq, inner } => (vec![*seq as i64], inner.clone()),
            Self::Ack { seq } => (vec![*seq as i64], Vec::new()),
            Self::Heartbeat {
                sender_time,
                sent_count,
                recv_count,
            } => (
                vec![*sender_time as i64, *sent_count as i64, *recv_count as i64],
                Vec::new(),
            ),
            Self::HeartbeatResponse {
                echoed_time,
                sender_time,
            } => (vec![*echoed_time as i64, *sender_time as i64], Vec::new()),
            Self::StreamRequest { total_length, data } => (vec![*total_length as i64], data.clone()),
            Self::Fragment(chunk) | Self::FragmentTail(chunk) | Self::Cluster(chunk) => {
                (Vec::new(), chunk.clone())
            }
            Self::Disconnect | Self::StreamCancel | Self::StreamCancelAck => {
                (Vec::new(), Vec::new())
            }
        };
        Record::from_values(schema, values, tail).encode()
    }
}

/// Split `payload` into Fragment records of `max_chunk` bytes followed by
/// one FragmentTail carrying the remainder.
pub fn split_fragments(payload: &[u8], max_chunk: usize) -> Vec<Vec<u8>> {
    let max_chunk = max_chunk.max(1);
    let mut records = Vec::with_capacity(payload.len() / max_chunk + 1);
    let mut rest = payload;
    while rest.len() > max_chunk {
        let (chunk, remainder) = rest.split_at(max_chunk);
        records.push(CoreRecord::Fragment(chunk.to_vec()).encode());
        rest = remainder;
    }
    records.push(CoreRecord::FragmentTail(rest.to_vec()).encode());
    records
}

/// Packs small records into as few Cluster records as fit a size limit.
#[derive(Debug)]
pub struct ClusterBuilder {
    limit: usize,
    clusters: Vec<Vec<u8>>,
    current: Vec<u8>,
}

impl ClusterBuilder {
    /// `limit` bounds each encoded Cluster record, header included.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            clusters: Vec::new(),
            current: Vec::new(),
        }
    }

    /// Append one record.
    pub fn push(&mut self, record: &[u8]) -> RecordResult<()> {
        if record.len() > MAX_CLUSTER_ENTRY || record.len() + 1 + CORE_CLEAR_PREFIX > self.limit {
            return Err(RecordError::EntryTooLarge(record.len()));
        }
        if CORE_CLEAR_PREFIX + self.current.len() + 1 + record.len() > self.limit {
            self.seal();
        }
        self.current.push(record.len() as u8);
        self.current.extend_from_slice(record);
        Ok(())
    }

    /// Encoded Cluster records.
    pub fn finish(mut self) -> Vec<Vec<u8>> {
        self.seal();
        self.clusters
    }

    fn seal(&mut self) {
        if !self.current.is_empty() {
            let body = std::mem::take(&mut self.current);
            self.clusters.push(CoreRecord::Cluster(body).encode());
        }
    }
}

/// Walks the entries of a cluster body.
///
/// Stops at the first entry whose declared length runs past the end of
/// the body; empty entries are skipped.
#[derive(Debug, Clone)]
pub struct ClusterEntries<'a> {
    rest: &'a [u8],
}

impl<'a> ClusterEntries<'a> {
    /// Iterate over `body`.
    pub fn new(body: &'a [u8]) -> Self {
        Self { rest: body }
    }

    /// Whether the walk stopped on a truncated entry.
    pub fn is_truncated(&self) -> bool {
        !self.rest.is_empty()
    }
}

impl<'a> Iterator for ClusterEntries<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (&len, body) = self.rest.split_first()?;
            let len = len as usize;
            if body.len() < len {
                return None;
            }
            let (entry, rest) = body.split_at(len);
            self.rest = rest;
            if !entry.is_empty() {
                return Some(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_records() -> Vec<CoreRecord> {
        vec![
            CoreRecord::Connect {
                key: -5,
                version: 1,
            },
            CoreRecord::ConnectResponse { server_key: 0x5678 },
            CoreRecord::Reliable {
                seq: 7,
                inner: vec![0x22, 1, 2, 3],
            },
            CoreRecord::Ack { seq: u32::MAX },
            CoreRecord::Heartbeat {
                sender_time: 78699,
                sent_count: 3,
                recv_count: 1,
            },
            CoreRecord::HeartbeatResponse {
                echoed_time: 78699,
                sender_time: 2014830415,
            },
            CoreRecord::Disconnect,
            CoreRecord::Fragment(vec![9; 480]),
            CoreRecord::FragmentTail(Vec::new()),
            CoreRecord::StreamRequest {
                total_length: 1000,
                data: vec![1, 2],
            },
            CoreRecord::StreamCancel,
            CoreRecord::StreamCancelAck,
            CoreRecord::Cluster(vec![2, 0x0e, 0x01]),
        ]
    }

    #[test]
    fn test_kind_byte_roundtrip() {
        for byte in 0..=255u8 {
            if let Some(kind) = CoreKind::from_byte(byte) {
                assert_eq!(kind.as_byte(), byte);
                assert_eq!(kind.schema().id, &[byte]);
            }
        }
        assert_eq!(CoreKind::from_byte(0x0D), None);
        assert_eq!(CoreKind::from_byte(0x10), None);
    }

    #[test]
    fn test_core_record_roundtrip() {
        for record in all_records() {
            let bytes = record.encode();
            assert_eq!(bytes.len(), record.kind().schema().header_len() + tail_len(&record));
            assert_eq!(CoreRecord::parse(&bytes).unwrap(), Some(record));
        }
    }

    fn tail_len(record: &CoreRecord) -> usize {
        match record {
            CoreRecord::Reliable { inner, .. } => inner.len(),
            CoreRecord::StreamRequest { data, .. } => data.len(),
            CoreRecord::Fragment(b) | CoreRecord::FragmentTail(b) | CoreRecord::Cluster(b) => {
                b.len()
            }
            _ => 0,
        }
    }

    #[test]
    fn test_captured_handshake_bytes() {
        let connect = hex::decode("0001f7bed3d70100").unwrap();
        assert_eq!(
            CoreRecord::parse(&connect).unwrap(),
            Some(CoreRecord::Connect {
                key: 0xd7d3bef7u32 as i32,
                version: 1
            })
        );

        let response = hex::decode("000209412c28").unwrap();
        let parsed = CoreRecord::parse(&response).unwrap().unwrap();
        assert_eq!(
            parsed,
            CoreRecord::ConnectResponse {
                server_key: 0x282c4109
            }
        );
        assert_eq!(parsed.encode(), response);
    }

    #[test]
    fn test_parse_truncated_is_error() {
        let err = CoreRecord::parse(&[0x00, KIND_ACK, 0x01]).unwrap_err();
        assert!(matches!(err, RecordError::Truncated { expected: 6, actual: 3 }));
    }

    #[test]
    fn test_parse_non_core() {
        assert_eq!(CoreRecord::parse(&[0x03, 0x00]).unwrap(), None);
        assert_eq!(CoreRecord::parse(&[0x00, 0x10, 1, 2]).unwrap(), None);
        assert_eq!(CoreRecord::parse(&[0x00]).unwrap(), None);
        assert_eq!(CoreRecord::parse(&[]).unwrap(), None);
    }

    #[test]
    fn test_clear_prefix() {
        assert_eq!(clear_prefix(&[0x00, 0x03]), 2);
        assert_eq!(clear_prefix(&[0x07, 0x03]), 1);
        assert_eq!(clear_prefix(&[]), 1);
    }

    #[test]
    fn test_split_fragments_2000() {
        let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        let records = split_fragments(&payload, 480);
        assert_eq!(records.len(), 5);

        let mut rebuilt = Vec::new();
        for (i, bytes) in records.iter().enumerate() {
            match CoreRecord::parse(bytes).unwrap().unwrap() {
                CoreRecord::Fragment(chunk) => {
                    assert!(i < 4);
                    assert_eq!(chunk.len(), 480);
                    rebuilt.extend(chunk);
                }
                CoreRecord::FragmentTail(chunk) => {
                    assert_eq!(i, 4);
                    assert_eq!(chunk.len(), 80);
                    rebuilt.extend(chunk);
                }
                other => panic!("unexpected record {other:?}"),
            }
        }
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn test_split_fragments_exact_multiple() {
        let records = split_fragments(&[1u8; 960], 480);
        assert_eq!(records.len(), 2);
        assert_eq!(
            CoreRecord::parse(&records[1]).unwrap(),
            Some(CoreRecord::FragmentTail(vec![1u8; 480]))
        );
    }

    #[test]
    fn test_cluster_builder_and_walk() {
        let records: Vec<Vec<u8>> = (1..=40u8).map(|n| vec![n; n as usize]).collect();
        let mut builder = ClusterBuilder::new(MAX_CHUNK_SIZE);
        for record in &records {
            builder.push(record).unwrap();
        }
        let clusters = builder.finish();
        assert!(clusters.len() > 1);

        let mut walked = Vec::new();
        for cluster in &clusters {
            assert!(cluster.len() <= MAX_CHUNK_SIZE);
            let Some(CoreRecord::Cluster(body)) = CoreRecord::parse(cluster).unwrap() else {
                panic!("not a cluster");
            };
            walked.extend(ClusterEntries::new(&body).map(<[u8]>::to_vec));
        }
        assert_eq!(walked, records);
    }

    #[test]
    fn test_cluster_entry_too_large() {
        let mut builder = ClusterBuilder::new(MAX_CHUNK_SIZE);
        assert_eq!(
            builder.push(&[0u8; 256]),
            Err(RecordError::EntryTooLarge(256))
        );
    }

    #[test]
    fn test_cluster_walk_truncated() {
        let body = [2, 0xaa, 0xbb, 0, 5, 0xcc];
        let mut entries = ClusterEntries::new(&body);
        assert_eq!(entries.next(), Some(&[0xaa, 0xbb][..]));
        assert_eq!(entries.next(), None);
        assert!(entries.is_truncated());
    }
}
