//! `.zpe` extension packages
//!
//! A package is a ZIP archive holding `manifest.json`, the `plugin.wasm`
//! module and optionally an icon. An embedded icon replaces the manifest's
//! icon URL with a base64 data URI.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use super::manifest::{Locator, Manifest};
use crate::core::error::{ExtensionError, Result};

pub const PACKAGE_EXTENSION: &str = "zpe";
pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const WASM_ENTRY: &str = "plugin.wasm";

/// Largest embedded icon that is turned into a data URI
pub const MAX_ICON_SIZE: u64 = 1024 * 1024;

/// Icon entries in lookup order, with their MIME types
const ICON_ENTRIES: &[(&str, &str)] = &[
    ("icon.png", "image/png"),
    ("icon.ico", "image/x-icon"),
    ("icon.jpg", "image/jpeg"),
    ("icon.jpeg", "image/jpeg"),
    ("icon.svg", "image/svg+xml"),
    ("icon.webp", "image/webp"),
];

/// Contents of an opened package
#[derive(Debug, Clone)]
pub struct ExtensionPackage {
    pub manifest: Manifest,
    pub wasm: Vec<u8>,
}

fn package_error(e: impl std::fmt::Display) -> ExtensionError {
    ExtensionError::BackendLoadError(format!("invalid package: {}", e))
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut file = archive
        .by_name(name)
        .map_err(|_| package_error(format!("{} not found in archive", name)))?;
    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;
    Ok(data)
}

fn read_icon<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Option<String> {
    for (name, mime) in ICON_ENTRIES {
        let mut file = match archive.by_name(name) {
            Ok(file) => file,
            Err(_) => continue,
        };
        let size = file.size();
        if size == 0 || size > MAX_ICON_SIZE {
            tracing::warn!(entry = %name, size, "ignoring embedded icon");
            continue;
        }
        let mut data = Vec::with_capacity(size as usize);
        if file.read_to_end(&mut data).is_err() {
            continue;
        }
        return Some(format!("data:{};base64,{}", mime, STANDARD.encode(&data)));
    }
    None
}

impl ExtensionPackage {
    /// Open a package from a reader; the manifest is validated
    pub fn open<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader).map_err(package_error)?;

        let manifest_bytes = read_entry(&mut archive, MANIFEST_ENTRY)?;
        let raw: serde_json::Value = serde_json::from_slice(&manifest_bytes)?;
        let mut manifest = Manifest::from_value(raw)?;

        if let Some(icon) = read_icon(&mut archive) {
            manifest.icon = Some(icon);
        }

        let wasm = read_entry(&mut archive, WASM_ENTRY)?;

        match &manifest.locator {
            None | Some(Locator::Module { .. }) => {
                manifest.locator = Some(Locator::Module {
                    path: WASM_ENTRY.to_string(),
                });
            }
            Some(other) => {
                return Err(package_error(format!(
                    "packages carry a module, manifest declares {:?}",
                    other
                )))
            }
        }

        Ok(Self { manifest, wasm })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::open(Cursor::new(bytes))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::open(file)
    }
}

/// Build a package archive
pub fn write_package(manifest_json: &str, wasm: &[u8], icon: Option<(&str, &[u8])>) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file(MANIFEST_ENTRY, options).map_err(package_error)?;
    zip.write_all(manifest_json.as_bytes())?;

    zip.start_file(WASM_ENTRY, options).map_err(package_error)?;
    zip.write_all(wasm)?;

    if let Some((name, data)) = icon {
        zip.start_file(name, options).map_err(package_error)?;
        zip.write_all(data)?;
    }

    Ok(zip.finish().map_err(package_error)?.into_inner())
}

pub fn is_package_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(PACKAGE_EXTENSION))
        .unwrap_or(false)
}
