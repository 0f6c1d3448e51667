//! Unwraps uploaded model files (plain, gzip or zip) into a bare PLY document.

use std::io::{Cursor, Read};

use flate2::read::MultiGzDecoder;
use tracing::{debug, info};

use crate::error::{AssetError, AssetResult};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceFormat {
    Ply,
    PlyGz,
    Zip,
}

impl SourceFormat {
    /// Picks the format from the file suffix, case-insensitively.
    pub fn from_filename(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".ply") {
            Some(SourceFormat::Ply)
        } else if lower.ends_with(".gz") {
            Some(SourceFormat::PlyGz)
        } else if lower.ends_with(".zip") {
            Some(SourceFormat::Zip)
        } else {
            None
        }
    }

    /// Picks the format from leading magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(ZIP_MAGIC) {
            Some(SourceFormat::Zip)
        } else if bytes.starts_with(GZIP_MAGIC) {
            Some(SourceFormat::PlyGz)
        } else if starts_with_ply_token(bytes) {
            Some(SourceFormat::Ply)
        } else {
            None
        }
    }
}

/// Raw uploaded bytes, consumed once by [`decode`].
#[derive(Clone, Debug)]
pub struct RawAsset {
    pub name: String,
    pub format: SourceFormat,
    pub bytes: Vec<u8>,
}

impl RawAsset {
    pub fn new(name: impl Into<String>, format: SourceFormat, bytes: Vec<u8>) -> Self {
        Self { name: name.into(), format, bytes }
    }

    /// Tags the bytes by filename suffix, falling back to content sniffing for
    /// names without a known suffix.
    pub fn from_named(name: impl Into<String>, bytes: Vec<u8>) -> AssetResult<Self> {
        let name = name.into();
        let format = SourceFormat::from_filename(&name)
            .or_else(|| SourceFormat::sniff(&bytes))
            .ok_or_else(|| AssetError::UnsupportedFormat(name.clone()))?;
        Ok(Self { name, format, bytes })
    }
}

/// A byte buffer holding exactly one PLY document.
#[derive(Clone, Debug)]
pub struct DecodedPly {
    pub name: String,
    pub bytes: Vec<u8>,
}

pub fn decode(raw: RawAsset) -> AssetResult<DecodedPly> {
    let RawAsset { name, format, bytes } = raw;
    let decoded = match format {
        SourceFormat::Ply => DecodedPly { name, bytes },
        SourceFormat::PlyGz => {
            let mut inflated = Vec::with_capacity(bytes.len() * 4);
            MultiGzDecoder::new(bytes.as_slice())
                .read_to_end(&mut inflated)
                .map_err(|e| AssetError::ArchiveCorrupt(format!("{name}: {e}")))?;
            debug!("Inflated {} -> {} bytes", bytes.len(), inflated.len());
            DecodedPly { name: strip_gz_suffix(&name), bytes: inflated }
        }
        SourceFormat::Zip => extract_first_ply(&bytes)?,
    };

    if !starts_with_ply_token(&decoded.bytes) {
        return Err(AssetError::UnsupportedFormat(format!(
            "{} does not contain a PLY document",
            decoded.name
        )));
    }
    Ok(decoded)
}

fn extract_first_ply(bytes: &[u8]) -> AssetResult<DecodedPly> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;

    // Names are read from the central directory without inflating anything.
    let mut selected = None;
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        if !entry.is_dir() && entry.name().to_ascii_lowercase().ends_with(".ply") {
            selected = Some(index);
            break;
        }
    }
    let index = selected.ok_or(AssetError::NoPlyInArchive)?;

    let mut entry = archive.by_index(index)?;
    let name = entry.name().to_string();
    let mut out = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut out)
        .map_err(|e| AssetError::ArchiveCorrupt(format!("{name}: {e}")))?;
    info!("Selected archive entry {} ({} bytes)", name, out.len());
    Ok(DecodedPly { name, bytes: out })
}

fn strip_gz_suffix(name: &str) -> String {
    if name.to_ascii_lowercase().ends_with(".gz") {
        name[..name.len() - 3].to_string()
    } else {
        name.to_string()
    }
}

fn starts_with_ply_token(bytes: &[u8]) -> bool {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    bytes[start..].starts_with(b"ply")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};
    use zip::write::SimpleFileOptions;

    const PLY: &[u8] = b"ply\nformat ascii 1.0\nelement vertex 1\nproperty float x\nproperty float y\nproperty float z\nend_header\n1 2 3\n";

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn plain_ply_passes_through() {
        let out = decode(RawAsset::new("dish.ply", SourceFormat::Ply, PLY.to_vec())).unwrap();
        assert_eq!(out.bytes, PLY);
        assert_eq!(out.name, "dish.ply");
    }

    #[test]
    fn gzip_is_inflated_and_suffix_stripped() {
        let raw = RawAsset::from_named("dish.ply.gz", gzip(PLY)).unwrap();
        assert_eq!(raw.format, SourceFormat::PlyGz);
        let out = decode(raw).unwrap();
        assert_eq!(out.bytes, PLY);
        assert_eq!(out.name, "dish.ply");
    }

    #[test]
    fn concatenated_gzip_members_are_all_inflated() {
        let (head, tail) = PLY.split_at(PLY.len() - 6);
        let mut bytes = gzip(head);
        bytes.extend_from_slice(&gzip(tail));
        let out = decode(RawAsset::new("dish.ply.gz", SourceFormat::PlyGz, bytes)).unwrap();
        assert_eq!(out.bytes, PLY);
    }

    #[test]
    fn corrupt_gzip_is_reported() {
        let mut bytes = gzip(PLY);
        bytes.truncate(bytes.len() / 2);
        let err = decode(RawAsset::new("dish.ply.gz", SourceFormat::PlyGz, bytes)).unwrap_err();
        assert!(matches!(err, AssetError::ArchiveCorrupt(_)));
    }

    #[test]
    fn zip_selects_first_ply_entry_case_insensitively() {
        let other: &[u8] = b"ply\nformat ascii 1.0\nelement vertex 0\nend_header\n";
        let bytes = zip_of(&[
            ("a.txt", b"not a model"),
            ("models/", b""),
            ("b.PLY", PLY),
            ("c.ply", other),
        ]);
        let out = decode(RawAsset::from_named("bundle.zip", bytes).unwrap()).unwrap();
        assert_eq!(out.name, "b.PLY");
        assert_eq!(out.bytes, PLY);
    }

    #[test]
    fn zip_without_ply_fails() {
        let bytes = zip_of(&[("readme.txt", b"hello"), ("scene.obj", b"v 0 0 0")]);
        let err = decode(RawAsset::new("bundle.zip", SourceFormat::Zip, bytes)).unwrap_err();
        assert!(matches!(err, AssetError::NoPlyInArchive));
    }

    #[test]
    fn garbage_zip_is_corrupt() {
        let err = decode(RawAsset::new("bundle.zip", SourceFormat::Zip, b"PK\x03\x04garbage".to_vec()))
            .unwrap_err();
        assert!(matches!(err, AssetError::ArchiveCorrupt(_)));
    }

    #[test]
    fn unknown_suffix_and_content_is_unsupported() {
        let err = RawAsset::from_named("dish.glb", b"glTF....".to_vec()).unwrap_err();
        assert!(matches!(err, AssetError::UnsupportedFormat(_)));
    }

    #[test]
    fn content_sniffing_covers_suffixless_names() {
        assert_eq!(RawAsset::from_named("download", gzip(PLY)).unwrap().format, SourceFormat::PlyGz);
        assert_eq!(RawAsset::from_named("download", PLY.to_vec()).unwrap().format, SourceFormat::Ply);
    }

    #[test]
    fn non_ply_payload_is_rejected() {
        let err = decode(RawAsset::new("dish.ply", SourceFormat::Ply, b"solid cube\n".to_vec())).unwrap_err();
        assert!(matches!(err, AssetError::UnsupportedFormat(_)));
    }
}
