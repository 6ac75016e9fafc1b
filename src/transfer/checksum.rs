//! Whole-object CRC64 checksums.
//!
//! The storage service reports CRC-64/XZ values (ECMA-182 polynomial,
//! reflected) as unsigned decimal strings.

use crc::{CRC_64_XZ, Crc};

use super::TransferError;
use crate::request::{DownloadSink, UploadSource};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Bytes read per step when checksumming a source or sink.
const READ_CHUNK: u64 = 1024 * 1024;

/// CRC64 of `bytes`.
#[must_use]
pub fn crc64(bytes: &[u8]) -> u64 {
    CRC64.checksum(bytes)
}

/// Renders a checksum the way the service reports it.
#[must_use]
pub fn format_crc64(value: u64) -> String {
    value.to_string()
}

/// Parses a service-reported checksum; `None` when it is not a decimal u64.
#[must_use]
pub fn parse_crc64(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

/// CRC64 of the first `total` bytes of `source`.
pub(crate) async fn source_crc64(
    source: &dyn UploadSource,
    total: u64,
) -> Result<u64, TransferError> {
    let mut digest = CRC64.digest();
    let mut offset = 0;
    while offset < total {
        let length = READ_CHUNK.min(total - offset);
        digest.update(&source.read_range(offset, length).await?);
        offset += length;
    }
    Ok(digest.finalize())
}

/// CRC64 of the first `total` bytes written to `sink`, or `None` when the
/// sink cannot read back what it stored.
pub(crate) async fn sink_crc64(
    sink: &dyn DownloadSink,
    total: u64,
) -> Result<Option<u64>, TransferError> {
    let mut digest = CRC64.digest();
    let mut offset = 0;
    while offset < total {
        let length = READ_CHUNK.min(total - offset);
        let Some(bytes) = sink.read_at(offset, length).await? else {
            return Ok(None);
        };
        digest.update(&bytes);
        offset += length;
    }
    Ok(Some(digest.finalize()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::request::{MemorySink, MemorySource};

    #[test]
    fn test_crc64_check_value() {
        assert_eq!(crc64(b"123456789"), 0x995D_C9BB_DF19_39FA);
        assert_eq!(crc64(b""), 0);
    }

    #[test]
    fn test_crc64_string_round_trip() {
        let value = crc64(b"hello");
        assert_eq!(parse_crc64(&format_crc64(value)), Some(value));
        assert_eq!(parse_crc64(" 42 "), Some(42));
        assert_eq!(parse_crc64("0xabc"), None);
    }

    #[tokio::test]
    async fn test_source_crc64_spans_read_chunks() {
        let data: Vec<u8> = (0..(READ_CHUNK as usize * 2 + 17)).map(|i| (i % 253) as u8).collect();
        let source = MemorySource::new(data.clone());
        let value = source_crc64(&source, data.len() as u64).await.unwrap();
        assert_eq!(value, crc64(&data));
    }

    #[tokio::test]
    async fn test_sink_crc64_reads_back_written_bytes() {
        let sink = MemorySink::new();
        sink.prepare(5).await.unwrap();
        sink.write_at(0, b"hello").await.unwrap();
        assert_eq!(sink_crc64(&sink, 5).await.unwrap(), Some(crc64(b"hello")));
    }
}
