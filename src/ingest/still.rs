//! Still-image sources for batch import.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::detect::FaceImage;
use crate::error::FlowError;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

#[derive(Clone)]
pub enum SourceRef {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl fmt::Debug for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Path(path) => f.debug_tuple("Path").field(path).finish(),
            SourceRef::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

/// One image to import. The label is unique within a batch.
#[derive(Clone, Debug)]
pub struct IngestionItem {
    pub source: SourceRef,
    pub label: String,
}

impl IngestionItem {
    pub fn from_path(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            source: SourceRef::Path(path.into()),
            label: label.into(),
        }
    }

    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, label: impl Into<String>) -> Self {
        Self {
            source: SourceRef::Bytes(bytes.into()),
            label: label.into(),
        }
    }
}

pub trait ImageDecoder: Send + Sync {
    fn decode(&self, item: &IngestionItem) -> Result<FaceImage, FlowError>;
}

/// Decodes JPEG, PNG and WebP through the `image` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, item: &IngestionItem) -> Result<FaceImage, FlowError> {
        let decoded = match &item.source {
            SourceRef::Path(path) => image::open(path),
            SourceRef::Bytes(bytes) => image::load_from_memory(bytes),
        };
        decoded
            .map(|image| image.to_rgb8())
            .map_err(|err| FlowError::Decode {
                label: item.label.clone(),
                reason: err.to_string(),
            })
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// List the importable images in `dir`, sorted by file name. Each item is
/// labelled with its file stem. An unreadable directory yields no items.
pub fn collect_items(dir: &Path) -> Vec<IngestionItem> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("cannot read import directory {}: {}", dir.display(), err);
            return Vec::new();
        }
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_image_file(path))
        .collect();
    paths.sort();
    paths
        .into_iter()
        .filter_map(|path| {
            let label = path.file_stem()?.to_string_lossy().into_owned();
            Some(IngestionItem::from_path(path, label))
        })
        .collect()
}
