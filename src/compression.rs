use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4d, 0x18];

/// Largest decompressed snapshot accepted by [`unpack`].
pub const MAX_DECOMPRESSED_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    None,
    Zstd(i32),
    Lz4,
}

impl CompressionCodec {
    pub fn none() -> Self {
        CompressionCodec::None
    }

    pub fn zstd_default() -> Self {
        CompressionCodec::Zstd(3)
    }

    pub fn zstd_best() -> Self {
        CompressionCodec::Zstd(19)
    }

    pub fn lz4_default() -> Self {
        CompressionCodec::Lz4
    }
}

impl Default for CompressionCodec {
    fn default() -> Self {
        CompressionCodec::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Zstd,
    Lz4,
}

impl From<CompressionCodec> for CompressionType {
    fn from(codec: CompressionCodec) -> Self {
        match codec {
            CompressionCodec::None => CompressionType::None,
            CompressionCodec::Zstd(_) => CompressionType::Zstd,
            CompressionCodec::Lz4 => CompressionType::Lz4,
        }
    }
}

/// Identifies a compressed blob by its frame magic.
pub fn detect(data: &[u8]) -> CompressionType {
    if data.starts_with(&ZSTD_MAGIC) {
        CompressionType::Zstd
    } else if data.starts_with(&LZ4_MAGIC) {
        CompressionType::Lz4
    } else {
        CompressionType::None
    }
}

/// Decompresses `data` if it carries a known frame magic, otherwise borrows it.
pub fn unpack(data: &[u8]) -> Result<Cow<'_, [u8]>> {
    unpack_limited(data, MAX_DECOMPRESSED_SIZE)
}

pub fn unpack_limited(data: &[u8], limit: usize) -> Result<Cow<'_, [u8]>> {
    match detect(data) {
        CompressionType::None => Ok(Cow::Borrowed(data)),
        compression_type => decompress_limited(data, compression_type, limit).map(Cow::Owned),
    }
}

pub fn decompress(data: &[u8], compression_type: CompressionType) -> Result<Vec<u8>> {
    decompress_limited(data, compression_type, MAX_DECOMPRESSED_SIZE)
}

#[cfg(feature = "compression")]
pub fn compress(data: &[u8], codec: CompressionCodec) -> Result<Vec<u8>> {
    match codec {
        CompressionCodec::None => Ok(data.to_vec()),

        CompressionCodec::Zstd(level) => {
            zstd::bulk::compress(data, level)
                .map_err(|e| TransferError::Compression(e.to_string()))
        }

        CompressionCodec::Lz4 => {
            let mut encoder = lz4::EncoderBuilder::new()
                .level(4)
                .build(Vec::new())
                .map_err(|e| TransferError::Compression(e.to_string()))?;

            std::io::copy(&mut &data[..], &mut encoder)
                .map_err(|e| TransferError::Compression(e.to_string()))?;

            let (compressed, result) = encoder.finish();
            result.map_err(|e| TransferError::Compression(e.to_string()))?;

            Ok(compressed)
        }
    }
}

#[cfg(feature = "compression")]
pub fn decompress_limited(data: &[u8], compression_type: CompressionType, limit: usize) -> Result<Vec<u8>> {
    match compression_type {
        CompressionType::None => Ok(data.to_vec()),

        CompressionType::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(data)
                .map_err(|e| TransferError::Decompression(e.to_string()))?;
            read_limited(decoder, limit)
        }

        CompressionType::Lz4 => {
            let decoder = lz4::Decoder::new(data)
                .map_err(|e| TransferError::Decompression(e.to_string()))?;
            read_limited(decoder, limit)
        }
    }
}

#[cfg(feature = "compression")]
fn read_limited<R: std::io::Read>(decoder: R, limit: usize) -> Result<Vec<u8>> {
    let mut decompressed = Vec::new();
    std::io::copy(&mut decoder.take(limit as u64 + 1), &mut decompressed)
        .map_err(|e| TransferError::Decompression(e.to_string()))?;

    if decompressed.len() > limit {
        return Err(TransferError::Decompression(format!(
            "decompressed size exceeds {} bytes",
            limit
        )));
    }

    Ok(decompressed)
}

#[cfg(not(feature = "compression"))]
pub fn compress(data: &[u8], codec: CompressionCodec) -> Result<Vec<u8>> {
    match codec {
        CompressionCodec::None => Ok(data.to_vec()),
        _ => Err(TransferError::Compression(
            "compression feature is disabled".to_string(),
        )),
    }
}

#[cfg(not(feature = "compression"))]
pub fn decompress_limited(data: &[u8], compression_type: CompressionType, _limit: usize) -> Result<Vec<u8>> {
    match compression_type {
        CompressionType::None => Ok(data.to_vec()),
        _ => Err(TransferError::Decompression(
            "compression feature is disabled".to_string(),
        )),
    }
}
