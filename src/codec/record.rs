//! Schema-driven record encoding.
//!
//! A record is a fixed header (prefix, id, little-endian integer fields)
//! followed by a free-form tail. Schemas are `'static` tables; records hold
//! their field values in schema order.

use byteorder::{ByteOrder, LittleEndian};

use crate::core::{RecordError, RecordResult};

/// One fixed-width integer field of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name, used by [`Record::get`] and [`RecordBuilder::field`].
    pub name: &'static str,
    /// Width in bytes (1..=8).
    pub width: usize,
    /// Whether the field is two's-complement signed.
    pub signed: bool,
    /// Value used when a builder does not override the field.
    pub default: i64,
}

impl FieldSpec {
    /// A signed field defaulting to zero.
    pub const fn signed(name: &'static str, width: usize) -> Self {
        Self {
            name,
            width,
            signed: true,
            default: 0,
        }
    }

    /// An unsigned field defaulting to zero.
    pub const fn unsigned(name: &'static str, width: usize) -> Self {
        Self {
            name,
            width,
            signed: false,
            default: 0,
        }
    }

    /// Replace the default value.
    pub const fn with_default(mut self, default: i64) -> Self {
        self.default = default;
        self
    }

    /// Check whether `value` can be stored in this field.
    pub fn accepts(&self, value: i64) -> bool {
        let bits = (self.width * 8) as u32;
        let value = value as i128;
        if self.signed {
            let half = 1i128 << (bits - 1);
            (-half..half).contains(&value)
        } else {
            (0..(1i128 << bits)).contains(&value)
        }
    }

    fn read(&self, buf: &[u8]) -> i64 {
        if self.signed {
            LittleEndian::read_int(buf, self.width)
        } else {
            LittleEndian::read_uint(buf, self.width) as i64
        }
    }

    fn write(&self, buf: &mut [u8], value: i64) {
        if self.signed {
            LittleEndian::write_int(buf, value, self.width);
        } else {
            LittleEndian::write_uint(buf, value as u64, self.width);
        }
    }
}

/// Wire shape of one record kind.
#[derive(Debug, PartialEq, Eq)]
pub struct RecordSchema {
    /// Human-readable kind name.
    pub name: &'static str,
    /// Leading bytes emitted before the id (the core marker for
    /// transport-internal records).
    pub prefix: &'static [u8],
    /// Kind identifier. Empty means the kind matches any input.
    pub id: &'static [u8],
    /// Fixed fields in wire order.
    pub fields: &'static [FieldSpec],
}

impl RecordSchema {
    /// Bytes before the tail.
    pub fn header_len(&self) -> usize {
        self.prefix.len() + self.id.len() + self.fields.iter().map(|f| f.width).sum::<usize>()
    }

    /// Whether `bytes` starts with this schema's prefix and id.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        let lead = self.prefix.len() + self.id.len();
        bytes.len() >= lead
            && bytes[..self.prefix.len()] == *self.prefix
            && bytes[self.prefix.len()..lead] == *self.id
    }

    /// Start a record with every field at its default.
    pub fn builder(&'static self) -> RecordBuilder {
        RecordBuilder {
            record: Record {
                schema: self,
                values: self.fields.iter().map(|f| f.default).collect(),
                tail: Vec::new(),
            },
        }
    }

    fn index_of(&self, name: &'static str) -> RecordResult<usize> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .ok_or(RecordError::UnknownField(name))
    }
}

/// A decoded or constructed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    schema: &'static RecordSchema,
    values: Vec<i64>,
    tail: Vec<u8>,
}

impl Record {
    /// Decode `bytes` against `schema`.
    ///
    /// Prefix and id bytes are skipped without validation; use
    /// [`RecordSchema::matches`] to classify input first.
    pub fn decode(bytes: &[u8], schema: &'static RecordSchema) -> RecordResult<Self> {
        let header = schema.header_len();
        if bytes.len() < header {
            return Err(RecordError::Truncated {
                expected: header,
                actual: bytes.len(),
            });
        }

        let mut offset = schema.prefix.len() + schema.id.len();
        let mut values = Vec::with_capacity(schema.fields.len());
        for field in schema.fields {
            values.push(field.read(&bytes[offset..offset + field.width]));
            offset += field.width;
        }

        Ok(Self {
            schema,
            values,
            tail: bytes[header..].to_vec(),
        })
    }

    /// Assemble a record from values already known to fit their fields.
    pub(crate) fn from_values(
        schema: &'static RecordSchema,
        values: Vec<i64>,
        tail: Vec<u8>,
    ) -> Self {
        debug_assert_eq!(values.len(), schema.fields.len());
        debug_assert!(schema.fields.iter().zip(&values).all(|(f, v)| f.accepts(*v)));
        Self {
            schema,
            values,
            tail,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let header = self.schema.header_len();
        let mut out = vec![0u8; header + self.tail.len()];

        let lead = self.schema.prefix.len();
        out[..lead].copy_from_slice(self.schema.prefix);
        out[lead..lead + self.schema.id.len()].copy_from_slice(self.schema.id);

        let mut offset = lead + self.schema.id.len();
        for (field, value) in self.schema.fields.iter().zip(&self.values) {
            field.write(&mut out[offset..offset + field.width], *value);
            offset += field.width;
        }

        out[header..].copy_from_slice(&self.tail);
        out
    }

    /// The schema this record follows.
    pub fn schema(&self) -> &'static RecordSchema {
        self.schema
    }

    /// Value of the named field.
    pub fn get(&self, name: &'static str) -> RecordResult<i64> {
        Ok(self.values[self.schema.index_of(name)?])
    }

    /// Overwrite the named field.
    pub fn set(&mut self, name: &'static str, value: i64) -> RecordResult<()> {
        let index = self.schema.index_of(name)?;
        if !self.schema.fields[index].accepts(value) {
            return Err(RecordError::FieldOutOfRange { field: name, value });
        }
        self.values[index] = value;
        Ok(())
    }

    /// Bytes after the fixed header.
    pub fn tail(&self) -> &[u8] {
        &self.tail
    }

    /// Take ownership of the tail.
    pub fn into_tail(self) -> Vec<u8> {
        self.tail
    }

    /// Encoded length.
    pub fn len(&self) -> usize {
        self.schema.header_len() + self.tail.len()
    }

    /// A record is never empty unless its schema has no header and no tail.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds a [`Record`] from schema defaults plus overrides.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    record: Record,
}

impl RecordBuilder {
    /// Override one field.
    pub fn field(mut self, name: &'static str, value: i64) -> RecordResult<Self> {
        self.record.set(name, value)?;
        Ok(self)
    }

    /// Set the tail bytes.
    pub fn tail(mut self, tail: impl Into<Vec<u8>>) -> Self {
        self.record.tail = tail.into();
        self
    }

    /// Finish the record.
    pub fn build(self) -> Record {
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PROBE: RecordSchema = RecordSchema {
        name: "Probe",
        prefix: &[],
        id: &[0x42],
        fields: &[
            FieldSpec::unsigned("kind", 1),
            FieldSpec::signed("x", 2).with_default(-7),
            FieldSpec::unsigned("count", 4).with_default(9),
            FieldSpec::signed("wide", 8),
        ],
    };

    static BARE: RecordSchema = RecordSchema {
        name: "Bare",
        prefix: &[],
        id: &[],
        fields: &[FieldSpec::unsigned("stamp", 4)],
    };

    #[test]
    fn test_header_len() {
        assert_eq!(PROBE.header_len(), 1 + 1 + 2 + 4 + 8);
        assert_eq!(BARE.header_len(), 4);
    }

    #[test]
    fn test_builder_defaults() {
        let record = PROBE.builder().build();
        assert_eq!(record.get("x").unwrap(), -7);
        assert_eq!(record.get("count").unwrap(), 9);
        assert_eq!(record.get("kind").unwrap(), 0);
        assert!(record.tail().is_empty());
    }

    #[test]
    fn test_encode_layout() {
        let record = PROBE
            .builder()
            .field("kind", 3)
            .unwrap()
            .field("x", -2)
            .unwrap()
            .field("count", 0x01020304)
            .unwrap()
            .tail(b"hi".to_vec())
            .build();

        let bytes = record.encode();
        assert_eq!(bytes.len(), PROBE.header_len() + 2);
        assert_eq!(&bytes[..8], &[0x42, 0x03, 0xfe, 0xff, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[16..], b"hi");
    }

    #[test]
    fn test_decode_sign_extends() {
        let mut bytes = PROBE.builder().build().encode();
        bytes[2] = 0x00;
        bytes[3] = 0x80;
        let record = Record::decode(&bytes, &PROBE).unwrap();
        assert_eq!(record.get("x").unwrap(), i16::MIN as i64);
    }

    #[test]
    fn test_round_trip_every_tail_length() {
        for len in 0..64usize {
            let tail: Vec<u8> = (0..len as u8).collect();
            let record = PROBE
                .builder()
                .field("wide", i64::MIN + len as i64)
                .unwrap()
                .tail(tail.clone())
                .build();
            let bytes = record.encode();
            let decoded = Record::decode(&bytes, &PROBE).unwrap();
            assert_eq!(decoded, record);
            assert_eq!(decoded.encode(), bytes);
        }
    }

    #[test]
    fn test_decode_truncated() {
        let err = Record::decode(&[0x42, 0x00, 0x00], &PROBE).unwrap_err();
        assert_eq!(
            err,
            RecordError::Truncated {
                expected: 16,
                actual: 3
            }
        );
    }

    #[test]
    fn test_field_range_checks() {
        assert!(matches!(
            PROBE.builder().field("kind", 256),
            Err(RecordError::FieldOutOfRange { field: "kind", .. })
        ));
        assert!(matches!(
            PROBE.builder().field("x", 40000),
            Err(RecordError::FieldOutOfRange { .. })
        ));
        assert!(matches!(
            PROBE.builder().field("count", -1),
            Err(RecordError::FieldOutOfRange { .. })
        ));
        assert!(PROBE.builder().field("count", u32::MAX as i64).is_ok());
        assert!(matches!(
            PROBE.builder().field("nope", 1),
            Err(RecordError::UnknownField("nope"))
        ));
    }

    #[test]
    fn test_zero_width_id_matches_anything() {
        assert!(BARE.matches(&[]));
        assert!(BARE.matches(&[0xff, 0x01]));
        assert!(PROBE.matches(&[0x42]));
        assert!(!PROBE.matches(&[0x43]));
        assert!(!PROBE.matches(&[]));
    }
}
