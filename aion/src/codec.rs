//! Bucket column codec.
//!
//! A column is a one byte format tag followed by one zigzag LEB128 varint per
//! sample. Each varint holds the difference to the previous sample; the first
//! one is taken against the anchor the column was encoded with. The buffer
//! carries no length header: the column ends where the bytes end.
//!
//! The time column of a bucket is anchored at the bucket start and stores unix
//! seconds, so it decodes straight to absolute timestamps. Value columns are
//! anchored at zero and store fixed-point integers (see [`quantize`]).

use std::io::{self, Cursor};

use byteorder::ReadBytesExt;
use tracing::trace;

use crate::error::{AionError, Result};

const FORMAT_TAG: u8 = 0xA1;
const MAX_VARINT_BYTES: usize = 10;

/// Fixed-point representation of `value`, rounded half away from zero.
pub fn quantize(value: f64, multiplier: f64) -> i64 {
    (value * multiplier).round() as i64
}

pub fn dequantize(quantized: i64, multiplier: f64) -> f64 {
    quantized as f64 / multiplier
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

// --- Encoding ---

/// Incrementally builds one encoded column.
#[derive(Debug, Clone)]
pub struct BucketEncoder {
    last: i64,
    count: usize,
    buf: Vec<u8>,
}

impl BucketEncoder {
    pub fn new(anchor: i64) -> Self {
        Self {
            last: anchor,
            count: 0,
            buf: vec![FORMAT_TAG],
        }
    }

    pub fn push(&mut self, value: i64) {
        write_varint(&mut self.buf, zigzag(value.wrapping_sub(self.last)));
        self.last = value;
        self.count += 1;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn finish(self) -> Vec<u8> {
        trace!(samples = self.count, bytes = self.buf.len(), "Encoded column");
        self.buf
    }
}

/// Encodes `values` against `anchor` in one go.
pub fn encode<I: IntoIterator<Item = i64>>(anchor: i64, values: I) -> Vec<u8> {
    let mut encoder = BucketEncoder::new(anchor);
    for value in values {
        encoder.push(value);
    }
    encoder.finish()
}

/// Encodes the time column of a bucket starting at `start`.
pub fn encode_time_column(start: i64, timestamps: &[i64]) -> Vec<u8> {
    encode(start, timestamps.iter().copied())
}

/// Quantizes and encodes one attribute column.
pub fn encode_value_column(values: &[f64], multiplier: f64) -> Vec<u8> {
    encode(0, values.iter().map(|v| quantize(*v, multiplier)))
}

// --- Decoding ---

/// Single-pass reader over one encoded column.
#[derive(Debug)]
pub struct BucketDecoder {
    column: String,
    cursor: Cursor<Vec<u8>>,
    current: i64,
    finished: bool,
    // Error hit while filling a buffer that already held values; surfaced on
    // the next read.
    pending: Option<AionError>,
}

impl BucketDecoder {
    pub fn new(anchor: i64, data: Vec<u8>) -> Result<Self> {
        Self::for_column("<unnamed>", anchor, data)
    }

    /// Like [`BucketDecoder::new`], naming the column in decode errors.
    pub fn for_column<C: Into<String>>(column: C, anchor: i64, data: Vec<u8>) -> Result<Self> {
        let column = column.into();
        let mut cursor = Cursor::new(data);
        match cursor.read_u8() {
            Ok(FORMAT_TAG) => {}
            Ok(other) => {
                return Err(AionError::decode(
                    column,
                    format!("unknown format tag {other:#04x}"),
                ))
            }
            Err(_) => return Err(AionError::decode(column, "missing format tag")),
        }
        Ok(Self {
            column,
            cursor,
            current: anchor,
            finished: false,
            pending: None,
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    fn read_varint(&mut self) -> Result<Option<u64>> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..MAX_VARINT_BYTES {
            let byte = match self.cursor.read_u8() {
                Ok(byte) => byte,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    if i == 0 {
                        return Ok(None);
                    }
                    return Err(AionError::decode(&*self.column, "truncated varint"));
                }
                Err(e) => return Err(AionError::decode(&*self.column, e.to_string())),
            };
            // The tenth byte may only contribute the top bit of a u64.
            if i == MAX_VARINT_BYTES - 1 && byte > 1 {
                return Err(AionError::decode(&*self.column, "varint overflows 64 bits"));
            }
            result |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(Some(result));
            }
            shift += 7;
        }
        Err(AionError::decode(&*self.column, "varint overflows 64 bits"))
    }

    /// Next decoded value, `Ok(None)` once the column is exhausted.
    pub fn next_value(&mut self) -> Result<Option<i64>> {
        if let Some(err) = self.pending.take() {
            return Err(err);
        }
        if self.finished {
            return Ok(None);
        }
        match self.read_varint() {
            Ok(Some(delta)) => {
                self.current = self.current.wrapping_add(unzigzag(delta));
                Ok(Some(self.current))
            }
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    /// Fills up to `buf.len()` slots in order and returns how many were
    /// filled. `Ok(0)` means end of data. A decode error found after some
    /// slots were filled is returned by the following call.
    pub fn read_values(&mut self, buf: &mut [i64]) -> Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.next_value() {
                Ok(Some(value)) => {
                    buf[n] = value;
                    n += 1;
                }
                Ok(None) => break,
                Err(e) if n > 0 => {
                    self.pending = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(n)
    }
}

impl Iterator for BucketDecoder {
    type Item = Result<i64>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_value().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(anchor: i64, data: Vec<u8>) -> Result<Vec<i64>> {
        BucketDecoder::new(anchor, data)?.collect()
    }

    #[test]
    fn time_column_decodes_to_absolute_timestamps() -> Result<()> {
        let start = 1_609_459_200;
        // Irregular sampling with a gap.
        let timestamps = [start, start + 1, start + 2, start + 37, start + 599];
        let data = encode_time_column(start, &timestamps);
        assert_eq!(decode_all(start, data)?, timestamps);
        Ok(())
    }

    #[test]
    fn values_round_trip_within_half_a_step() -> Result<()> {
        for multiplier in [1.0, 10.0, 100.0, 1000.0] {
            let values = [0.0, 1.0, 2.5, 3.25, -7.125, 1234.5678, -0.04, 99_999.99];
            let data = encode_value_column(&values, multiplier);
            let decoded = decode_all(0, data)?;
            assert_eq!(decoded.len(), values.len());
            for (written, q) in values.iter().zip(decoded) {
                let restored = dequantize(q, multiplier);
                assert!(
                    (restored - written).abs() <= 0.5 / multiplier + 1e-9,
                    "{written} came back as {restored} at multiplier {multiplier}"
                );
            }
        }
        Ok(())
    }

    #[test]
    fn quantize_rounds_half_away_from_zero() {
        assert_eq!(quantize(3.25, 10.0), 33);
        assert_eq!(quantize(-3.25, 10.0), -33);
        assert_eq!(quantize(2.5, 10.0), 25);
        assert!((dequantize(33, 10.0) - 3.3).abs() < 1e-12);
    }

    #[test]
    fn extreme_deltas_survive_wrapping() -> Result<()> {
        let values = [i64::MAX, i64::MIN, 0, i64::MIN, i64::MAX];
        assert_eq!(decode_all(0, encode(0, values))?, values);
        Ok(())
    }

    #[test]
    fn empty_column_is_just_the_tag() -> Result<()> {
        let data = encode(42, std::iter::empty());
        assert_eq!(data.len(), 1);
        assert!(decode_all(42, data)?.is_empty());
        Ok(())
    }

    #[test]
    fn read_values_fills_in_chunks_then_reports_end() -> Result<()> {
        let values: Vec<i64> = (0..7).map(|i| i * 10).collect();
        let mut decoder = BucketDecoder::new(0, encode(0, values.clone()))?;
        let mut buf = [0i64; 3];
        let mut seen = Vec::new();
        loop {
            let n = decoder.read_values(&mut buf)?;
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
        }
        assert_eq!(seen, values);
        // Single pass: still exhausted.
        assert_eq!(decoder.read_values(&mut buf)?, 0);
        Ok(())
    }

    #[test]
    fn truncated_column_reports_error_after_good_values() -> Result<()> {
        let mut data = encode(0, [1, 2, 300_000]);
        data.pop();
        let mut decoder = BucketDecoder::for_column("raw", 0, data)?;
        let mut buf = [0i64; 8];
        assert_eq!(decoder.read_values(&mut buf)?, 2);
        assert_eq!(&buf[..2], &[1, 2]);
        match decoder.read_values(&mut buf) {
            Err(AionError::Decode { column, .. }) => assert_eq!(column, "raw"),
            other => panic!("expected decode error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn bad_tag_and_empty_buffer_are_rejected() {
        assert!(matches!(
            BucketDecoder::new(0, vec![0x00, 0x02]),
            Err(AionError::Decode { .. })
        ));
        assert!(matches!(
            BucketDecoder::new(0, Vec::new()),
            Err(AionError::Decode { .. })
        ));
    }

    #[test]
    fn overlong_varint_is_rejected() -> Result<()> {
        let mut data = vec![FORMAT_TAG];
        data.extend(std::iter::repeat(0xFF).take(11));
        let mut decoder = BucketDecoder::new(0, data)?;
        assert!(decoder.next_value().is_err());
        assert_eq!(decoder.next_value()?, None);
        Ok(())
    }
}
