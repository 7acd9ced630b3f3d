//! Field Codec
//!
//! Packs primitive values into a byte buffer and reads them back.
//!
//! - integers: LEB128 varints (signed values zigzag-mapped)
//! - `f64`: 8 bytes little endian
//! - UUID: 16 raw bytes
//! - timestamp: seconds (signed varint), nanoseconds (varint), UTC offset in
//!   seconds (signed varint)
//! - string: varint `len + 1` then UTF-8 bytes; `0` encodes null
//! - arrays: varint length, then runs (see [`FieldWriter::write_array`])

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, FixedOffset, TimeDelta};
use contracts::{FieldType, Timestamp};
use uuid::Uuid;

use crate::error::{CodecError, Result};
use crate::varint::{get_uvarint, put_uvarint, unzigzag, zigzag};

/// Refuse to materialize arrays longer than this
pub const MAX_ARRAY_LEN: usize = 1 << 24;

/// Appends encoded fields to an in-memory buffer
#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: BytesMut,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_i64(i64::from(value));
    }

    pub fn write_i64(&mut self, value: i64) {
        put_uvarint(&mut self.buf, zigzag(value));
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_u64(u64::from(value));
    }

    pub fn write_u64(&mut self, value: u64) {
        put_uvarint(&mut self.buf, value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    pub fn write_uuid(&mut self, value: &Uuid) {
        self.buf.put_slice(value.as_bytes());
    }

    pub fn write_timestamp(&mut self, value: &Timestamp) {
        self.write_i64(value.timestamp());
        self.write_u32(value.timestamp_subsec_nanos());
        self.write_i32(value.offset().local_minus_utc());
    }

    pub fn write_duration(&mut self, value: TimeDelta) {
        self.write_i64(value.num_seconds());
        self.write_i32(value.subsec_nanos());
    }

    /// Nullable string
    pub fn write_string(&mut self, value: Option<&str>) {
        match value {
            None => self.write_u64(0),
            Some(s) => {
                self.write_u64(s.len() as u64 + 1);
                self.buf.put_slice(s.as_bytes());
            }
        }
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_string(Some(value));
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_u64(value.len() as u64);
        self.buf.put_slice(value);
    }

    /// Already-encoded field data, copied verbatim
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn write_value<T: FieldValue>(&mut self, value: &T) {
        value.encode(self);
    }

    /// Run-length encoded array
    ///
    /// The length is followed by runs. A run header is a signed integer:
    /// `n > 0` means the next single value repeats `n` times, `-n` means the
    /// next `n` values are individually encoded. Runs are found greedily from
    /// the left; a value that equals its successor opens a repeating run. The
    /// last element, when not part of a repeating run, always lands in a
    /// unique run (a lone trailing value is written as `-1`).
    pub fn write_array<T: FieldValue>(&mut self, values: &[T]) {
        let n = values.len();
        self.write_u64(n as u64);

        let starts_repeat = |j: usize| j + 1 < n && values[j].same_value(&values[j + 1]);

        let mut i = 0;
        while i < n {
            if starts_repeat(i) {
                let mut j = i + 1;
                while starts_repeat(j) {
                    j += 1;
                }
                self.write_i64((j - i + 1) as i64);
                values[i].encode(self);
                i = j + 1;
            } else {
                let mut j = i + 1;
                while j < n && !starts_repeat(j) {
                    j += 1;
                }
                self.write_i64(-((j - i) as i64));
                for value in &values[i..j] {
                    value.encode(self);
                }
                i = j;
            }
        }
    }
}

/// Reads encoded fields from a byte slice
#[derive(Debug)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Unread bytes, consuming them
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }

    fn need(&self, needed: usize) -> Result<()> {
        if self.buf.len() < needed {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::invalid(format!("invalid bool byte {other}"))),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let value = self.read_i64()?;
        i32::try_from(value).map_err(|_| CodecError::invalid(format!("{value} overflows i32")))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(unzigzag(get_uvarint(&mut self.buf)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.read_u64()?;
        u32::try_from(value).map_err(|_| CodecError::invalid(format!("{value} overflows u32")))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        get_uvarint(&mut self.buf)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.need(8)?;
        Ok(self.buf.get_f64_le())
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        let bytes = self.take(16)?;
        Uuid::from_slice(bytes).map_err(|e| CodecError::invalid(e.to_string()))
    }

    pub fn read_timestamp(&mut self) -> Result<Timestamp> {
        let secs = self.read_i64()?;
        let nanos = self.read_u32()?;
        let offset_secs = self.read_i32()?;
        let offset = FixedOffset::east_opt(offset_secs)
            .ok_or_else(|| CodecError::invalid(format!("invalid utc offset {offset_secs}s")))?;
        let utc = DateTime::from_timestamp(secs, nanos)
            .ok_or_else(|| CodecError::invalid(format!("timestamp {secs}.{nanos} out of range")))?;
        Ok(utc.with_timezone(&offset))
    }

    pub fn read_duration(&mut self) -> Result<TimeDelta> {
        let secs = self.read_i64()?;
        // Signed like the whole value, so -0.5s keeps its sign
        let nanos = self.read_i32()?;
        if nanos.unsigned_abs() >= 1_000_000_000 {
            return Err(CodecError::invalid(format!("sub-second part {nanos}ns out of range")));
        }
        TimeDelta::try_seconds(secs)
            .and_then(|whole| whole.checked_add(&TimeDelta::nanoseconds(i64::from(nanos))))
            .ok_or_else(|| CodecError::invalid(format!("duration {secs}s out of range")))
    }

    pub fn read_string(&mut self) -> Result<Option<String>> {
        let len = self.read_u64()?;
        if len == 0 {
            return Ok(None);
        }
        let len = usize::try_from(len - 1)
            .map_err(|_| CodecError::invalid("string length overflows usize"))?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|e| CodecError::invalid(e.to_string()))
    }

    /// Non-null string; `field` names the field in the error
    pub fn read_required_string(&mut self, field: &str) -> Result<String> {
        self.read_string()?
            .ok_or_else(|| CodecError::invalid(format!("field '{field}' must not be null")))
    }

    pub fn read_bytes(&mut self) -> Result<Bytes> {
        let len = self.read_u64()?;
        let len =
            usize::try_from(len).map_err(|_| CodecError::invalid("byte length overflows usize"))?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    pub fn read_value<T: FieldValue>(&mut self) -> Result<T> {
        T::decode(self)
    }

    /// Inverse of [`FieldWriter::write_array`]
    pub fn read_array<T: FieldValue>(&mut self) -> Result<Vec<T>> {
        let len = self.read_u64()?;
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= MAX_ARRAY_LEN)
            .ok_or_else(|| CodecError::invalid(format!("array length {len} exceeds limit")))?;

        let mut values = Vec::with_capacity(len.min(self.remaining()));
        while values.len() < len {
            let header = self.read_i64()?;
            let left = len - values.len();
            let count = usize::try_from(header.unsigned_abs())
                .ok()
                .filter(|count| *count <= left)
                .ok_or_else(|| {
                    CodecError::invalid(format!("run of {header} exceeds {left} remaining values"))
                })?;
            match header {
                0 => return Err(CodecError::invalid("zero-length array run")),
                h if h > 0 => {
                    let value = T::decode(self)?;
                    values.extend(std::iter::repeat_n(value, count));
                }
                _ => {
                    for _ in 0..count {
                        values.push(T::decode(self)?);
                    }
                }
            }
        }
        Ok(values)
    }
}

/// A value that can appear as an array element
pub trait FieldValue: Sized + Clone {
    /// Wire type of an array of this value
    const ARRAY_TYPE: FieldType;

    fn encode(&self, writer: &mut FieldWriter);

    fn decode(reader: &mut FieldReader<'_>) -> Result<Self>;

    /// Equality used for run detection; two nulls are the same value
    fn same_value(&self, other: &Self) -> bool;
}

impl FieldValue for bool {
    const ARRAY_TYPE: FieldType = FieldType::BoolArray;

    fn encode(&self, writer: &mut FieldWriter) {
        writer.write_bool(*self);
    }

    fn decode(reader: &mut FieldReader<'_>) -> Result<Self> {
        reader.read_bool()
    }

    fn same_value(&self, other: &Self) -> bool {
        self == other
    }
}

impl FieldValue for i32 {
    const ARRAY_TYPE: FieldType = FieldType::Int32Array;

    fn encode(&self, writer: &mut FieldWriter) {
        writer.write_i32(*self);
    }

    fn decode(reader: &mut FieldReader<'_>) -> Result<Self> {
        reader.read_i32()
    }

    fn same_value(&self, other: &Self) -> bool {
        self == other
    }
}

impl FieldValue for i64 {
    const ARRAY_TYPE: FieldType = FieldType::Int64Array;

    fn encode(&self, writer: &mut FieldWriter) {
        writer.write_i64(*self);
    }

    fn decode(reader: &mut FieldReader<'_>) -> Result<Self> {
        reader.read_i64()
    }

    fn same_value(&self, other: &Self) -> bool {
        self == other
    }
}

impl FieldValue for u64 {
    const ARRAY_TYPE: FieldType = FieldType::UInt64Array;

    fn encode(&self, writer: &mut FieldWriter) {
        writer.write_u64(*self);
    }

    fn decode(reader: &mut FieldReader<'_>) -> Result<Self> {
        reader.read_u64()
    }

    fn same_value(&self, other: &Self) -> bool {
        self == other
    }
}

impl FieldValue for f64 {
    const ARRAY_TYPE: FieldType = FieldType::DoubleArray;

    fn encode(&self, writer: &mut FieldWriter) {
        writer.write_f64(*self);
    }

    fn decode(reader: &mut FieldReader<'_>) -> Result<Self> {
        reader.read_f64()
    }

    // Bitwise, so 0.0 / -0.0 and NaN payloads survive a round trip
    fn same_value(&self, other: &Self) -> bool {
        self.to_bits() == other.to_bits()
    }
}

impl FieldValue for Uuid {
    const ARRAY_TYPE: FieldType = FieldType::GuidArray;

    fn encode(&self, writer: &mut FieldWriter) {
        writer.write_uuid(self);
    }

    fn decode(reader: &mut FieldReader<'_>) -> Result<Self> {
        reader.read_uuid()
    }

    fn same_value(&self, other: &Self) -> bool {
        self == other
    }
}

impl FieldValue for Timestamp {
    const ARRAY_TYPE: FieldType = FieldType::TimestampArray;

    fn encode(&self, writer: &mut FieldWriter) {
        writer.write_timestamp(self);
    }

    fn decode(reader: &mut FieldReader<'_>) -> Result<Self> {
        reader.read_timestamp()
    }

    // Same instant is not enough; the offset is encoded too
    fn same_value(&self, other: &Self) -> bool {
        self == other && self.offset() == other.offset()
    }
}

impl FieldValue for String {
    const ARRAY_TYPE: FieldType = FieldType::StringArray;

    fn encode(&self, writer: &mut FieldWriter) {
        writer.write_str(self);
    }

    fn decode(reader: &mut FieldReader<'_>) -> Result<Self> {
        reader.read_required_string("array element")
    }

    fn same_value(&self, other: &Self) -> bool {
        self == other
    }
}

impl FieldValue for Option<String> {
    const ARRAY_TYPE: FieldType = FieldType::StringArray;

    fn encode(&self, writer: &mut FieldWriter) {
        writer.write_string(self.as_deref());
    }

    fn decode(reader: &mut FieldReader<'_>) -> Result<Self> {
        reader.read_string()
    }

    fn same_value(&self, other: &Self) -> bool {
        self == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn round_trip<T: FieldValue + PartialEq + std::fmt::Debug>(values: &[T]) -> Vec<T> {
        let mut writer = FieldWriter::new();
        writer.write_array(values);
        let bytes = writer.freeze();
        let mut reader = FieldReader::new(&bytes);
        let decoded = reader.read_array::<T>().unwrap();
        assert_eq!(reader.remaining(), 0);
        decoded
    }

    fn run_headers(values: &[i64]) -> Vec<i64> {
        let mut writer = FieldWriter::new();
        writer.write_array(values);
        let bytes = writer.freeze();
        let mut reader = FieldReader::new(&bytes);
        let len = reader.read_u64().unwrap() as usize;
        let mut seen = 0;
        let mut headers = Vec::new();
        while seen < len {
            let header = reader.read_i64().unwrap();
            headers.push(header);
            let count = header.unsigned_abs() as usize;
            let values_in_run = if header > 0 { 1 } else { count };
            for _ in 0..values_in_run {
                reader.read_i64().unwrap();
            }
            seen += count;
        }
        headers
    }

    #[test]
    fn empty_and_single_arrays() {
        assert_eq!(round_trip::<i64>(&[]), Vec::<i64>::new());
        assert_eq!(round_trip(&[42i64]), vec![42]);
        assert_eq!(run_headers(&[]), Vec::<i64>::new());
        assert_eq!(run_headers(&[7]), vec![-1]);
    }

    #[test]
    fn run_detection_is_greedy() {
        assert_eq!(run_headers(&[1, 1, 1]), vec![3]);
        assert_eq!(run_headers(&[1, 2, 3]), vec![-3]);
        assert_eq!(run_headers(&[1, 2, 2, 3]), vec![-1, 2, -1]);
        assert_eq!(run_headers(&[5, 5, 6, 7, 7, 7]), vec![2, -1, 3]);
    }

    #[test]
    fn trailing_single_value_is_a_unique_run() {
        assert_eq!(run_headers(&[4, 4, 4, 9]), vec![3, -1]);
        assert_eq!(run_headers(&[1, 2, 2, 3, 4]), vec![-1, 2, -2]);
    }

    #[test]
    fn repeated_run_is_smaller_than_unique_encoding() {
        let repeated = vec![123_456i64; 100];
        let unique: Vec<i64> = (0..100).map(|i| 123_456 + i).collect();

        let mut a = FieldWriter::new();
        a.write_array(&repeated);
        let mut b = FieldWriter::new();
        b.write_array(&unique);
        assert!(a.len() < b.len());
        assert_eq!(round_trip(&repeated), repeated);
        assert_eq!(round_trip(&unique), unique);
    }

    #[test]
    fn null_strings_form_runs() {
        let values = vec![None, None, Some("a".to_string()), None, Some("a".to_string())];
        assert_eq!(round_trip(&values), values);

        let mut writer = FieldWriter::new();
        writer.write_array(&values);
        let bytes = writer.freeze();
        let mut reader = FieldReader::new(&bytes);
        assert_eq!(reader.read_u64().unwrap(), 5);
        // two nulls repeat, the rest are unique
        assert_eq!(reader.read_i64().unwrap(), 2);
    }

    #[test]
    fn signed_zero_and_nan_survive() {
        let values = vec![0.0f64, -0.0, f64::NAN, f64::NAN, 1.5];
        let decoded = round_trip(&values);
        assert_eq!(decoded.len(), 5);
        assert!(decoded[1].is_sign_negative());
        assert!(decoded[2].is_nan() && decoded[3].is_nan());
        assert_eq!(decoded[4], 1.5);
    }

    #[test]
    fn scalar_round_trip() {
        let ts = FixedOffset::east_opt(5 * 3600 + 1800)
            .unwrap()
            .with_ymd_and_hms(2024, 2, 29, 23, 59, 58)
            .unwrap()
            + TimeDelta::nanoseconds(123_456_789);
        let id = Uuid::new_v4();

        let mut writer = FieldWriter::new();
        writer.write_bool(true);
        writer.write_i32(-17);
        writer.write_i64(i64::MIN);
        writer.write_u32(u32::MAX);
        writer.write_u64(u64::MAX);
        writer.write_f64(std::f64::consts::PI);
        writer.write_uuid(&id);
        writer.write_timestamp(&ts);
        writer.write_duration(TimeDelta::milliseconds(-1500));
        writer.write_duration(TimeDelta::milliseconds(-500));
        writer.write_string(None);
        writer.write_str("héllo");
        writer.write_bytes(&[1, 2, 3]);
        let bytes = writer.freeze();

        let mut reader = FieldReader::new(&bytes);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_i32().unwrap(), -17);
        assert_eq!(reader.read_i64().unwrap(), i64::MIN);
        assert_eq!(reader.read_u32().unwrap(), u32::MAX);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX);
        assert_eq!(reader.read_f64().unwrap(), std::f64::consts::PI);
        assert_eq!(reader.read_uuid().unwrap(), id);
        let back = reader.read_timestamp().unwrap();
        assert_eq!(back, ts);
        assert_eq!(back.offset(), ts.offset());
        assert_eq!(reader.read_duration().unwrap(), TimeDelta::milliseconds(-1500));
        assert_eq!(reader.read_duration().unwrap(), TimeDelta::milliseconds(-500));
        assert_eq!(reader.read_string().unwrap(), None);
        assert_eq!(reader.read_string().unwrap().as_deref(), Some("héllo"));
        assert_eq!(&reader.read_bytes().unwrap()[..], &[1, 2, 3]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn truncated_input_is_reported() {
        let mut reader = FieldReader::new(&[1, 2, 3]);
        assert!(matches!(
            reader.read_f64(),
            Err(CodecError::Truncated { needed: 8, remaining: 3 })
        ));
    }

    #[test]
    fn corrupt_runs_are_rejected() {
        // length 2, run header +5
        let mut writer = FieldWriter::new();
        writer.write_u64(2);
        writer.write_i64(5);
        writer.write_i64(1);
        let bytes = writer.freeze();
        assert!(FieldReader::new(&bytes).read_array::<i64>().is_err());

        // zero-length run
        let mut writer = FieldWriter::new();
        writer.write_u64(1);
        writer.write_i64(0);
        let bytes = writer.freeze();
        assert!(FieldReader::new(&bytes).read_array::<i64>().is_err());
    }

    proptest! {
        #[test]
        fn prop_i64_arrays_round_trip(values in proptest::collection::vec(-3i64..3, 0..64)) {
            prop_assert_eq!(round_trip(&values), values);
        }

        #[test]
        fn prop_string_arrays_round_trip(
            values in proptest::collection::vec(proptest::option::of("[ab]{0,2}"), 0..32)
        ) {
            prop_assert_eq!(round_trip(&values), values);
        }

        #[test]
        fn prop_f64_arrays_round_trip(values in proptest::collection::vec(prop_oneof![Just(0.0f64), Just(1.0), any::<f64>()], 0..32)) {
            let decoded = round_trip(&values);
            prop_assert_eq!(decoded.len(), values.len());
            for (a, b) in decoded.iter().zip(&values) {
                prop_assert_eq!(a.to_bits(), b.to_bits());
            }
        }
    }
}
