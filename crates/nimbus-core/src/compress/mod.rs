use std::io::Read;

use serde::{Deserialize, Serialize};

use nimbus_types::error::{NimbusError, Result};

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_DEFLATE: u8 = 0x02;
const TAG_ZSTD: u8 = 0x03;

/// Maximum decompressed output size (64 MiB, 4x the largest block size).
/// Prevents decompression bombs from consuming unbounded memory.
const MAX_DECOMPRESS_SIZE: u64 = 64 * 1024 * 1024;

/// Per-mount compression choice. `Zstd` is the high-ratio default,
/// `Deflate` the middle ground, `Lz4` the fast low-ratio option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    None,
    Lz4,
    Deflate {
        level: u32,
    },
    #[default]
    Zstd,
    ZstdLevel {
        level: i32,
    },
}

impl Compression {
    /// Parse from config strings like "zstd", "deflate", "lz4", "none".
    pub fn from_config(algorithm: &str, level: i32) -> Result<Self> {
        match algorithm {
            "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "deflate" => Ok(Compression::Deflate {
                level: level.clamp(1, 9) as u32,
            }),
            "zstd" => Ok(Compression::ZstdLevel { level }),
            other => Err(NimbusError::Config(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }

    fn zstd_level(self) -> i32 {
        match self {
            Compression::ZstdLevel { level } => level,
            _ => 6,
        }
    }
}

/// Compress data and prepend a 1-byte tag identifying the codec, so the
/// download path can always pick the right decompressor regardless of the
/// mount's current setting.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(TAG_NONE);
            out.extend_from_slice(data);
            Ok(out)
        }
        Compression::Lz4 => {
            let compressed = lz4_flex::compress_prepend_size(data);
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_LZ4);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
        Compression::Deflate { level } => {
            use flate2::write::ZlibEncoder;
            use std::io::Write;
            let mut encoder = ZlibEncoder::new(
                vec![TAG_DEFLATE],
                flate2::Compression::new(level.clamp(1, 9)),
            );
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| NimbusError::Other(format!("deflate compress: {e}")))
        }
        Compression::Zstd | Compression::ZstdLevel { .. } => {
            use std::cell::RefCell;
            thread_local! {
                static ZSTD_CX: RefCell<Option<(i32, zstd::bulk::Compressor<'static>)>> =
                    const { RefCell::new(None) };
            }

            let level = compression.zstd_level();
            ZSTD_CX.with(|cell| {
                let mut slot = cell.borrow_mut();

                // Lazily init or reinit if the compression level changed.
                if !matches!(slot.as_ref(), Some((l, _)) if *l == level) {
                    let cx = zstd::bulk::Compressor::new(level)
                        .map_err(|e| NimbusError::Other(format!("zstd init: {e}")))?;
                    *slot = Some((level, cx));
                }
                let (_, cx) = slot.as_mut().unwrap();

                let compressed = cx
                    .compress(data)
                    .map_err(|e| NimbusError::Other(format!("zstd compress: {e}")))?;
                let mut out = Vec::with_capacity(1 + compressed.len());
                out.push(TAG_ZSTD);
                out.extend_from_slice(&compressed);
                Ok(out)
            })
        }
    }
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
/// Any codec failure is a decompression error; we never guess a codec.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(NimbusError::Decompression("empty data".into()));
    }
    let tag = data[0];
    let payload = &data[1..];
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_LZ4 => {
            if payload.len() < 4 {
                return Err(NimbusError::Decompression("lz4: payload too short".into()));
            }
            let uncompressed_size = u32::from_le_bytes(payload[..4].try_into().unwrap()) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(NimbusError::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| NimbusError::Decompression(format!("lz4: {e}")))
        }
        TAG_DEFLATE => {
            let decoder = flate2::read::ZlibDecoder::new(payload);
            read_bounded(decoder, "deflate")
        }
        TAG_ZSTD => {
            let decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| NimbusError::Decompression(format!("zstd init: {e}")))?;
            read_bounded(decoder, "zstd")
        }
        _ => Err(NimbusError::UnknownCompressionTag(tag)),
    }
}

/// Drain a streaming decoder while enforcing the decompression-size cap.
fn read_bounded(decoder: impl Read, codec: &str) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    let mut limited = decoder.take(MAX_DECOMPRESS_SIZE + 1);
    limited
        .read_to_end(&mut output)
        .map_err(|e| NimbusError::Decompression(format!("{codec}: {e}")))?;
    if output.len() as u64 > MAX_DECOMPRESS_SIZE {
        return Err(NimbusError::Decompression(format!(
            "{codec}: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
        )));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_codecs() -> Vec<Compression> {
        vec![
            Compression::None,
            Compression::Lz4,
            Compression::Deflate { level: 6 },
            Compression::ZstdLevel { level: 3 },
        ]
    }

    #[test]
    fn roundtrip_all_codecs() {
        let payloads: &[&[u8]] = &[
            b"",
            b"short",
            b"this payload is long enough to actually compress, repeated repeated repeated",
        ];
        for codec in all_codecs() {
            for payload in payloads {
                let encoded = compress(codec, payload).unwrap();
                let decoded = decompress(&encoded).unwrap();
                assert_eq!(&decoded, payload, "codec {codec:?}");
            }
        }
    }

    #[test]
    fn tag_is_self_describing() {
        // A block compressed with one codec decompresses correctly even if
        // the mount has since switched algorithms.
        let data = vec![0x5A; 4096];
        let encoded = compress(Compression::Lz4, &data).unwrap();
        assert_eq!(encoded[0], TAG_LZ4);
        assert_eq!(decompress(&encoded).unwrap(), data);
    }

    #[test]
    fn decompress_rejects_lz4_bomb() {
        // Huge size prefix (1 GiB) with tiny compressed data.
        let mut data = vec![TAG_LZ4];
        data.extend_from_slice(&(1u32 << 30).to_le_bytes());
        data.extend_from_slice(&[0u8; 10]);
        assert!(decompress(&data).is_err());
    }

    #[test]
    fn decompress_rejects_short_lz4_payload() {
        let data = vec![TAG_LZ4, 0x00, 0x00];
        assert!(decompress(&data).is_err());
    }

    #[test]
    fn decompress_rejects_unknown_tag() {
        let err = decompress(&[0x7F, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, NimbusError::UnknownCompressionTag(0x7F)));
    }

    #[test]
    fn decompress_rejects_empty_input() {
        assert!(decompress(&[]).is_err());
    }

    #[test]
    fn corrupt_zstd_payload_is_decompression_error() {
        let mut encoded = compress(Compression::ZstdLevel { level: 3 }, b"intact data").unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        encoded[1] ^= 0xFF;
        assert!(matches!(
            decompress(&encoded),
            Err(NimbusError::Decompression(_))
        ));
    }

    #[test]
    fn from_config_parses_known_algorithms() {
        assert_eq!(
            Compression::from_config("none", 0).unwrap(),
            Compression::None
        );
        assert_eq!(
            Compression::from_config("lz4", 0).unwrap(),
            Compression::Lz4
        );
        assert!(matches!(
            Compression::from_config("deflate", 6).unwrap(),
            Compression::Deflate { level: 6 }
        ));
        assert!(matches!(
            Compression::from_config("zstd", 9).unwrap(),
            Compression::ZstdLevel { level: 9 }
        ));
        assert!(Compression::from_config("snappy", 0).is_err());
    }
}
