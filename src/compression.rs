//! Decompression providers for inbound message payloads.
//!
//! One provider per wire compression type, created lazily on first use and
//! cached for the consumer's lifetime. The key space is tiny and bounded, so
//! the cache has no eviction; providers are closed when the consumer closes.

use crate::error::DriftmqClientError;
use crate::protocol::CompressionType;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::Read;
use std::sync::Arc;

/// Decompressor for one compression codec
pub trait CompressionProvider: Send + Sync {
    fn decompress(
        &self,
        src: &[u8],
        uncompressed_size: usize,
    ) -> Result<Bytes, DriftmqClientError>;

    /// Release provider-held resources; the default holds none.
    fn close(&self) {}
}

/// Pass-through provider for uncompressed payloads
pub struct NoopProvider;

impl CompressionProvider for NoopProvider {
    fn decompress(
        &self,
        src: &[u8],
        _uncompressed_size: usize,
    ) -> Result<Bytes, DriftmqClientError> {
        Ok(Bytes::copy_from_slice(src))
    }
}

/// ZLIB (deflate) provider
pub struct ZlibProvider;

impl CompressionProvider for ZlibProvider {
    fn decompress(
        &self,
        src: &[u8],
        uncompressed_size: usize,
    ) -> Result<Bytes, DriftmqClientError> {
        let mut buffer = Vec::with_capacity(uncompressed_size);
        let mut decoder = flate2::read::ZlibDecoder::new(src);
        decoder
            .read_to_end(&mut buffer)
            .map_err(|e| DriftmqClientError::decompression(e.to_string()))?;
        Ok(Bytes::from(buffer))
    }
}

/// LZ4 block provider; requires the exact uncompressed size from metadata
pub struct Lz4Provider;

impl CompressionProvider for Lz4Provider {
    fn decompress(
        &self,
        src: &[u8],
        uncompressed_size: usize,
    ) -> Result<Bytes, DriftmqClientError> {
        let buffer = lz4_flex::decompress(src, uncompressed_size)
            .map_err(|e| DriftmqClientError::decompression(e.to_string()))?;
        Ok(Bytes::from(buffer))
    }
}

/// Zstandard provider
pub struct ZstdProvider;

impl CompressionProvider for ZstdProvider {
    fn decompress(
        &self,
        src: &[u8],
        uncompressed_size: usize,
    ) -> Result<Bytes, DriftmqClientError> {
        let mut buffer = Vec::with_capacity(uncompressed_size);
        zstd::stream::copy_decode(src, &mut buffer)
            .map_err(|e| DriftmqClientError::decompression(e.to_string()))?;
        Ok(Bytes::from(buffer))
    }
}

/// Lazy, per-consumer cache of compression providers keyed by codec
#[derive(Default)]
pub struct ProviderCache {
    providers: DashMap<CompressionType, Arc<dyn CompressionProvider>>,
}

impl ProviderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_init(&self, kind: CompressionType) -> Arc<dyn CompressionProvider> {
        self.providers
            .entry(kind)
            .or_insert_with(|| match kind {
                CompressionType::None => Arc::new(NoopProvider),
                CompressionType::Zlib => Arc::new(ZlibProvider),
                CompressionType::Lz4 => Arc::new(Lz4Provider),
                CompressionType::Zstd => Arc::new(ZstdProvider),
            })
            .clone()
    }

    /// Close and drop every cached provider
    pub fn close_all(&self) {
        for entry in self.providers.iter() {
            entry.value().close();
        }
        self.providers.clear();
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_noop_round_trip() {
        let provider = NoopProvider;
        let out = provider.decompress(b"plain bytes", 11).unwrap();
        assert_eq!(&out[..], b"plain bytes");
    }

    #[test]
    fn test_zlib_round_trip() {
        let data = b"driftmq zlib payload with repeated data repeated data repeated data";
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(data).unwrap();
        let compressed = encoder.finish().unwrap();

        let provider = ZlibProvider;
        let out = provider.decompress(&compressed, data.len()).unwrap();
        assert_eq!(&out[..], data);
    }

    #[test]
    fn test_lz4_round_trip() {
        let data = b"driftmq lz4 payload with repeated data repeated data repeated data";
        let compressed = lz4_flex::compress(data);

        let provider = Lz4Provider;
        let out = provider.decompress(&compressed, data.len()).unwrap();
        assert_eq!(&out[..], data);
    }

    #[test]
    fn test_zstd_round_trip() {
        let data = b"driftmq zstd payload with repeated data repeated data repeated data";
        let compressed = zstd::encode_all(&data[..], 3).unwrap();

        let provider = ZstdProvider;
        let out = provider.decompress(&compressed, data.len()).unwrap();
        assert_eq!(&out[..], data);
    }

    #[test]
    fn test_corrupt_input_is_an_error() {
        let provider = Lz4Provider;
        assert!(provider.decompress(b"\xff\xff\xff", 64).is_err());
        let provider = ZlibProvider;
        assert!(provider.decompress(b"\x00\x01", 64).is_err());
    }

    #[test]
    fn test_cache_reuses_providers() {
        let cache = ProviderCache::new();
        let a = cache.get_or_init(CompressionType::Lz4);
        let b = cache.get_or_init(CompressionType::Lz4);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        cache.get_or_init(CompressionType::Zstd);
        assert_eq!(cache.len(), 2);

        cache.close_all();
        assert!(cache.is_empty());
    }
}
