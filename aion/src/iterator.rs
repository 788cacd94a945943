//! Entry reconstruction from the decoded columns of one bucket.

use tracing::trace;

use crate::{
    codec::{dequantize, BucketDecoder},
    error::{AionError, Result},
    types::{from_unix, Entry},
};

/// Rebuilds entries from one bucket by zipping the time column with the
/// attribute columns position by position.
///
/// Position `i` of every attribute decoder belongs to the `i`-th timestamp of
/// the time decoder. An attribute column that runs out early simply leaves the
/// attribute off the remaining entries.
#[derive(Debug)]
pub struct BucketEntryReader {
    multiplier: f64,
    time: BucketDecoder,
    columns: Vec<BucketDecoder>,
    pending: Option<AionError>,
}

impl BucketEntryReader {
    pub fn new(multiplier: f64, time: BucketDecoder, columns: Vec<BucketDecoder>) -> Self {
        Self {
            multiplier,
            time,
            columns,
            pending: None,
        }
    }

    /// Next reconstructed entry, `Ok(None)` when the time column is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        if let Some(err) = self.pending.take() {
            return Err(err);
        }
        let Some(unix) = self.time.next_value()? else {
            return Ok(None);
        };
        let mut entry = Entry::new(from_unix(unix)?);
        for decoder in &mut self.columns {
            if let Some(quantized) = decoder.next_value()? {
                entry.attributes.insert(
                    decoder.column().to_string(),
                    dequantize(quantized, self.multiplier),
                );
            }
        }
        trace!(timestamp = unix, attributes = entry.attributes.len(), "Reconstructed entry");
        Ok(Some(entry))
    }

    /// Overwrites up to `buf.len()` slots with entries in encounter order and
    /// returns the number written. `Ok(0)` means the bucket is exhausted; an
    /// error found after some slots were written is returned by the next call.
    pub fn read_entries(&mut self, buf: &mut [Entry]) -> Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.next_entry() {
                Ok(Some(entry)) => {
                    buf[n] = entry;
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

impl Iterator for BucketEntryReader {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, encode_time_column, encode_value_column};
    use crate::types::TIME_ATTRIBUTE;

    fn reader(start: i64, times: &[i64], columns: &[(&str, Vec<u8>)]) -> Result<BucketEntryReader> {
        let time =
            BucketDecoder::for_column(TIME_ATTRIBUTE, start, encode_time_column(start, times))?;
        let columns = columns
            .iter()
            .map(|(name, data)| BucketDecoder::for_column(*name, 0, data.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(BucketEntryReader::new(10.0, time, columns))
    }

    #[test]
    fn zips_columns_by_position() -> Result<()> {
        let entries: Vec<Entry> = reader(
            600,
            &[600, 660, 720],
            &[
                ("raw", encode_value_column(&[1.0, 2.5, 3.25], 10.0)),
                ("count", encode_value_column(&[1.0, 2.0, 3.0], 10.0)),
            ],
        )?
        .collect::<Result<_>>()?;

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].unix(), 720);
        assert!((entries[2].get("raw").unwrap() - 3.3).abs() < 1e-9);
        assert_eq!(entries[1].get("count"), Some(2.0));
        Ok(())
    }

    #[test]
    fn short_column_omits_trailing_attributes() -> Result<()> {
        let entries: Vec<Entry> = reader(
            0,
            &[0, 1, 2],
            &[("raw", encode_value_column(&[4.0], 10.0))],
        )?
        .collect::<Result<_>>()?;

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].get("raw"), Some(4.0));
        assert!(entries[1].attributes.is_empty());
        assert!(entries[2].attributes.is_empty());
        Ok(())
    }

    #[test]
    fn read_entries_fills_slots_then_reports_corruption() -> Result<()> {
        let mut corrupt = encode(0, [10, 20, 70_000]);
        corrupt.pop();
        let mut reader = reader(0, &[0, 1, 2], &[("raw", corrupt)])?;

        let mut buf = vec![Entry::default(); 4];
        assert_eq!(reader.read_entries(&mut buf)?, 2);
        assert_eq!(buf[1].get("raw"), Some(2.0));
        assert!(reader.read_entries(&mut buf).is_err());
        Ok(())
    }
}
