//! Pluggable body compression codecs.
//!
//! A codec failure is always loud: decompression never falls back to
//! passing the compressed bytes through.

use crate::error::ProtocolError;
use crate::header::Compression;
use bytes::Bytes;

/// Default zstd compression level.
const ZSTD_LEVEL: i32 = 3;

/// A compress/uncompress pair selected by the header compression flag.
pub trait BodyCodec: Send + Sync {
    /// The compression flag this codec owns.
    fn kind(&self) -> Compression;

    fn compress(&self, body: &[u8]) -> Result<Bytes, ProtocolError>;

    /// Fails if the size metadata of the compressed block cannot be
    /// determined or the decompressed contents do not match it.
    fn uncompress(&self, body: &[u8]) -> Result<Bytes, ProtocolError>;
}

/// LZ4 block codec.
///
/// The decompressed size travels as a 4-byte little-endian prefix of the
/// compressed block.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Codec;

impl BodyCodec for Lz4Codec {
    fn kind(&self) -> Compression {
        Compression::Lz4
    }

    fn compress(&self, body: &[u8]) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(lz4_flex::compress_prepend_size(body)))
    }

    fn uncompress(&self, body: &[u8]) -> Result<Bytes, ProtocolError> {
        lz4_flex::decompress_size_prepended(body)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Codec(format!("lz4: {}", e)))
    }
}

/// ZSTD codec.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self { level: ZSTD_LEVEL }
    }
}

impl ZstdCodec {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl BodyCodec for ZstdCodec {
    fn kind(&self) -> Compression {
        Compression::Zstd
    }

    fn compress(&self, body: &[u8]) -> Result<Bytes, ProtocolError> {
        zstd::bulk::compress(body, self.level)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Codec(format!("zstd: {}", e)))
    }

    fn uncompress(&self, body: &[u8]) -> Result<Bytes, ProtocolError> {
        zstd::decode_all(body)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Codec(format!("zstd: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::checksum_body;
    use proptest::prelude::*;

    fn codecs() -> Vec<Box<dyn BodyCodec>> {
        vec![Box::new(Lz4Codec), Box::new(ZstdCodec::default())]
    }

    #[test]
    fn test_roundtrip_preserves_body_and_checksum() {
        let body: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        for codec in codecs() {
            let compressed = codec.compress(&body).unwrap();
            let restored = codec.uncompress(&compressed).unwrap();
            assert_eq!(&restored[..], &body[..], "codec {}", codec.kind());
            assert_eq!(checksum_body(&restored), checksum_body(&body));
        }
    }

    #[test]
    fn test_compressible_data_shrinks() {
        let body = vec![0x41u8; 64 * 1024];
        for codec in codecs() {
            let compressed = codec.compress(&body).unwrap();
            assert!(compressed.len() < body.len(), "codec {}", codec.kind());
        }
    }

    #[test]
    fn test_uncompress_garbage_fails_loudly() {
        let garbage = [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0x02];
        for codec in codecs() {
            assert!(matches!(
                codec.uncompress(&garbage),
                Err(ProtocolError::Codec(_))
            ));
        }
    }

    #[test]
    fn test_lz4_truncated_size_prefix_fails() {
        let compressed = Lz4Codec.compress(b"some body worth compressing").unwrap();
        assert!(Lz4Codec.uncompress(&compressed[..2]).is_err());
    }

    proptest! {
        #[test]
        fn prop_codec_roundtrip(body in proptest::collection::vec(any::<u8>(), 0..4096)) {
            for codec in codecs() {
                let compressed = codec.compress(&body).unwrap();
                let restored = codec.uncompress(&compressed).unwrap();
                prop_assert_eq!(&restored[..], &body[..]);
            }
        }
    }
}
