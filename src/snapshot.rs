//! Configuration snapshots in the wire protocol's own layout.
//!
//! A saved snapshot is byte-for-byte a valid configuration frame of the
//! chosen variant, checksum included. Loading runs the same decode path as
//! live traffic, so a snapshot can never describe a configuration the
//! codec would not have accepted off the wire.

use bytes::Bytes;

use crate::codec::{self, FrameCodec};
use crate::config::ProtocolVariant;
use crate::error::{PmuError, Result};
use crate::types::{ConfigurationFrame, FrameType, RawFrameImage};

/// Serialize a configuration as a native configuration frame.
///
/// Fails when the configuration does not fit the variant's length field
/// (IEEE 1344 declares frame lengths in 11 bits).
pub fn save(config: &ConfigurationFrame, variant: ProtocolVariant) -> Result<Vec<u8>> {
    codec::for_variant(variant)
        .encode_configuration(config)
        .map_err(|e| PmuError::Snapshot { reason: e.to_string() })
}

/// Deserialize a snapshot produced by [`save`] for the same variant.
pub fn load(variant: ProtocolVariant, bytes: &[u8]) -> Result<ConfigurationFrame> {
    let codec = codec::for_variant(variant);
    if bytes.len() < codec.min_frame_len() {
        return Err(PmuError::Snapshot {
            reason: format!("{} bytes is shorter than any {variant} frame", bytes.len()),
        });
    }

    let header = codec
        .decode_header(bytes)
        .map_err(|e| PmuError::Snapshot { reason: e.to_string() })?;
    if header.frame_type != FrameType::Configuration {
        return Err(PmuError::Snapshot {
            reason: format!("snapshot holds a {} frame", header.frame_type.name()),
        });
    }
    if header.declared_len != bytes.len() {
        return Err(PmuError::Snapshot {
            reason: format!(
                "declared length {} does not match snapshot size {}",
                header.declared_len,
                bytes.len()
            ),
        });
    }

    let image = RawFrameImage::new(Bytes::copy_from_slice(bytes), header.frame_type);
    codec
        .decode_configuration(&image)
        .map_err(|e| PmuError::Snapshot { reason: e.to_string() })
}
