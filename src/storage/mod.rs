//! Feature stores and face image persistence.
//!
//! - `FeatureStore`: 1:1 verification features, one per label.
//! - `SearchIndex`: the 1:N search library, ranked by a `FeatureComparator`.
//! - `FaceImageStore`: cropped face images per purpose directory.
//!
//! Each store has a SQLite (or filesystem) implementation and an in-memory
//! one. `FaceLibrary` ties them together for enrollment, deletion and import.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::config::{KernelConfig, StoragePaths};
use crate::detect::{FaceImage, FeatureComparator};
use crate::error::FlowError;
use crate::ingest::IngestionSink;
use crate::{now_ms, validate_label};

mod images;
mod memory;
mod sqlite;

pub use images::FsFaceImageStore;
pub use memory::{InMemoryFeatureStore, InMemorySearchIndex};
pub use sqlite::{SqliteFeatureStore, SqliteSearchIndex};

pub trait FeatureStore: Send {
    /// Insert or replace the feature for `label`.
    fn put(&mut self, label: &str, feature: &str) -> Result<()>;
    fn get(&self, label: &str) -> Result<Option<String>>;
    fn delete(&mut self, label: &str) -> Result<bool>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchRecord {
    pub label: String,
    pub feature: String,
    pub created_at_ms: i64,
    pub tag: String,
    pub group: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchMatch {
    pub label: String,
    pub similarity: f32,
}

pub trait SearchIndex: Send {
    /// Insert a record, replacing any record with the same label.
    fn insert(&mut self, record: SearchRecord) -> Result<()>;
    fn delete_by_label(&mut self, label: &str) -> Result<bool>;
    /// All records ranked by similarity to `feature`, best first.
    fn search(&self, feature: &str, comparator: &dyn FeatureComparator)
        -> Result<Vec<SearchMatch>>;
    fn len(&self) -> Result<usize>;
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    fn clear(&mut self) -> Result<usize>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageDir {
    Verify,
    Search,
    /// Scene captures from successful verifications.
    Log,
}

pub trait FaceImageStore: Send + Sync {
    fn save(&self, dir: ImageDir, label: &str, image: &FaceImage) -> Result<PathBuf>;
    fn delete(&self, dir: ImageDir, label: &str) -> Result<bool>;
    fn clear(&self, dir: ImageDir) -> Result<usize>;
}

pub(crate) fn rank_matches<'a>(
    records: impl Iterator<Item = &'a SearchRecord>,
    feature: &str,
    comparator: &dyn FeatureComparator,
) -> Result<Vec<SearchMatch>> {
    let mut matches = Vec::new();
    for record in records {
        match comparator.similarity(feature, &record.feature) {
            Ok(similarity) => matches.push(SearchMatch {
                label: record.label.clone(),
                similarity,
            }),
            Err(err) => log::warn!("skipping {} during search: {}", record.label, err),
        }
    }
    matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    Ok(matches)
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// FaceLibrary
// ----------------------------------------------------------------------------

pub struct FaceLibrary {
    verify: Mutex<Box<dyn FeatureStore>>,
    search: Mutex<Box<dyn SearchIndex>>,
    images: Box<dyn FaceImageStore>,
}

impl FaceLibrary {
    pub fn new(
        verify: Box<dyn FeatureStore>,
        search: Box<dyn SearchIndex>,
        images: Box<dyn FaceImageStore>,
    ) -> Self {
        Self {
            verify: Mutex::new(verify),
            search: Mutex::new(search),
            images,
        }
    }

    /// SQLite stores at `cfg.db_path`, images under the configured data dir.
    pub fn open(cfg: &KernelConfig) -> Result<Self> {
        Ok(Self::new(
            Box::new(SqliteFeatureStore::open(&cfg.db_path)?),
            Box::new(SqliteSearchIndex::open(&cfg.db_path)?),
            Box::new(FsFaceImageStore::new(cfg.paths.clone())),
        ))
    }

    /// In-memory feature stores; images still go to `paths`.
    pub fn in_memory(paths: StoragePaths) -> Self {
        Self::new(
            Box::new(InMemoryFeatureStore::default()),
            Box::new(InMemorySearchIndex::default()),
            Box::new(FsFaceImageStore::new(paths)),
        )
    }

    pub fn enroll_verify(&self, label: &str, feature: &str, crop: &FaceImage) -> Result<()> {
        validate_label(label)?;
        lock(&self.verify).put(label, feature)?;
        self.images
            .save(ImageDir::Verify, label, crop)
            .with_context(|| format!("save verification face for {}", label))?;
        log::info!("enrolled {} for verification", label);
        Ok(())
    }

    /// Add `label` to the search library. If the face image cannot be saved
    /// the feature is removed again so the two never disagree.
    pub fn enroll_search(
        &self,
        label: &str,
        feature: &str,
        crop: &FaceImage,
        tag: &str,
        group: &str,
    ) -> Result<()> {
        validate_label(label)?;
        lock(&self.search).insert(SearchRecord {
            label: label.to_string(),
            feature: feature.to_string(),
            created_at_ms: now_ms(),
            tag: tag.to_string(),
            group: group.to_string(),
        })?;
        if let Err(err) = self.images.save(ImageDir::Search, label, crop) {
            if let Err(rollback) = lock(&self.search).delete_by_label(label) {
                log::warn!("failed to roll back search record {}: {}", label, rollback);
            }
            return Err(err.context(format!("save search face for {}", label)));
        }
        log::debug!("enrolled {} for search", label);
        Ok(())
    }

    pub fn reference_feature(&self, label: &str) -> Result<Option<String>> {
        lock(&self.verify).get(label)
    }

    pub fn delete_verify(&self, label: &str) -> Result<bool> {
        let removed = lock(&self.verify).delete(label)?;
        let image_removed = self.images.delete(ImageDir::Verify, label)?;
        Ok(removed || image_removed)
    }

    pub fn delete_search(&self, label: &str) -> Result<bool> {
        let removed = lock(&self.search).delete_by_label(label)?;
        let image_removed = self.images.delete(ImageDir::Search, label)?;
        Ok(removed || image_removed)
    }

    /// Drop every search feature and cached search image.
    pub fn clear_search(&self) -> Result<usize> {
        let removed = lock(&self.search).clear()?;
        let images = self.images.clear(ImageDir::Search)?;
        log::info!(
            "cleared search library ({} features, {} images)",
            removed,
            images
        );
        Ok(removed)
    }

    pub fn search(
        &self,
        feature: &str,
        comparator: &dyn FeatureComparator,
    ) -> Result<Vec<SearchMatch>> {
        lock(&self.search).search(feature, comparator)
    }

    pub fn search_len(&self) -> Result<usize> {
        lock(&self.search).len()
    }

    /// Keep the frame that passed verification, named `<label>_<ms>.png`.
    pub fn save_scene(&self, label: &str, image: &FaceImage) -> Result<PathBuf> {
        self.images
            .save(ImageDir::Log, &format!("{}_{}", label, now_ms()), image)
    }
}

impl IngestionSink for FaceLibrary {
    fn persist(&self, label: &str, feature: &str, crop: &FaceImage) -> Result<(), FlowError> {
        self.enroll_search(label, feature, crop, "", "")
            .map_err(|err| FlowError::Persistence {
                label: label.to_string(),
                reason: format!("{:#}", err),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubExtractor;
    use crate::shared_memory_uri;
    use image::{Rgb, RgbImage};

    fn feature(level: u8) -> String {
        hex::encode(vec![level; 64])
    }

    fn exercise_feature_store(store: &mut dyn FeatureStore) -> Result<()> {
        assert_eq!(store.get("alice")?, None);
        store.put("alice", "aa")?;
        store.put("alice", "bb")?;
        assert_eq!(store.get("alice")?.as_deref(), Some("bb"));
        assert!(store.delete("alice")?);
        assert!(!store.delete("alice")?);
        Ok(())
    }

    fn exercise_search_index(index: &mut dyn SearchIndex) -> Result<()> {
        let comparator = StubExtractor::new();
        assert!(index.is_empty()?);
        for (label, level) in [("near", 100u8), ("far", 10), ("exact", 120)] {
            index.insert(SearchRecord {
                label: label.to_string(),
                feature: feature(level),
                created_at_ms: 1,
                tag: String::new(),
                group: "staff".to_string(),
            })?;
        }
        let ranked = index.search(&feature(120), &comparator)?;
        let labels: Vec<&str> = ranked.iter().map(|m| m.label.as_str()).collect();
        assert_eq!(labels, vec!["exact", "near", "far"]);
        assert!((ranked[0].similarity - 1.0).abs() < 1e-6);

        assert!(index.delete_by_label("near")?);
        assert_eq!(index.len()?, 2);
        assert_eq!(index.clear()?, 2);
        assert!(index.is_empty()?);
        Ok(())
    }

    #[test]
    fn sqlite_and_memory_feature_stores_agree() -> Result<()> {
        exercise_feature_store(&mut InMemoryFeatureStore::default())?;
        exercise_feature_store(&mut SqliteFeatureStore::open(&shared_memory_uri())?)?;
        Ok(())
    }

    #[test]
    fn sqlite_and_memory_search_indexes_agree() -> Result<()> {
        exercise_search_index(&mut InMemorySearchIndex::default())?;
        exercise_search_index(&mut SqliteSearchIndex::open(&shared_memory_uri())?)?;
        Ok(())
    }

    #[test]
    fn library_enrolls_deletes_and_clears() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let paths = StoragePaths::under(dir.path());
        let library = FaceLibrary::in_memory(paths.clone());
        let crop = RgbImage::from_pixel(8, 8, Rgb([90, 90, 90]));

        library.enroll_verify("alice", &feature(90), &crop)?;
        assert!(paths.verify_dir.join("alice.png").exists());
        assert_eq!(library.reference_feature("alice")?, Some(feature(90)));
        assert!(library.delete_verify("alice")?);
        assert_eq!(library.reference_feature("alice")?, None);
        assert!(!paths.verify_dir.join("alice.png").exists());

        library.enroll_search("bob", &feature(50), &crop, "vip", "lobby")?;
        library.enroll_search("carol", &feature(60), &crop, "", "")?;
        assert_eq!(library.search_len()?, 2);
        assert!(library.delete_search("bob")?);
        assert_eq!(library.clear_search()?, 1);
        assert_eq!(library.search_len()?, 0);
        assert_eq!(std::fs::read_dir(&paths.search_dir)?.count(), 0);
        Ok(())
    }

    #[test]
    fn invalid_labels_are_not_enrolled() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let library = FaceLibrary::in_memory(StoragePaths::under(dir.path()));
        let crop = RgbImage::from_pixel(8, 8, Rgb([90, 90, 90]));
        assert!(library.enroll_search("../escape", &feature(1), &crop, "", "").is_err());
        assert_eq!(library.search_len()?, 0);
        Ok(())
    }

    #[test]
    fn failed_image_save_rolls_back_search_record() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"file, not a directory")?;
        let library = FaceLibrary::in_memory(StoragePaths::under(&blocker));
        let crop = RgbImage::from_pixel(8, 8, Rgb([90, 90, 90]));

        let err = library.persist("dave", &feature(1), &crop).unwrap_err();
        assert!(matches!(err, FlowError::Persistence { .. }));
        assert_eq!(library.search_len()?, 0);
        Ok(())
    }
}
