use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{FaceImageStore, ImageDir};
use crate::config::StoragePaths;
use crate::detect::FaceImage;

/// Face images as `<dir>/<label>.png`.
#[derive(Clone, Debug)]
pub struct FsFaceImageStore {
    paths: StoragePaths,
}

impl FsFaceImageStore {
    pub fn new(paths: StoragePaths) -> Self {
        Self { paths }
    }

    fn dir(&self, dir: ImageDir) -> &Path {
        match dir {
            ImageDir::Verify => &self.paths.verify_dir,
            ImageDir::Search => &self.paths.search_dir,
            ImageDir::Log => &self.paths.log_dir,
        }
    }

    pub fn path_for(&self, dir: ImageDir, label: &str) -> PathBuf {
        self.dir(dir).join(format!("{label}.png"))
    }
}

impl FaceImageStore for FsFaceImageStore {
    fn save(&self, dir: ImageDir, label: &str, image: &FaceImage) -> Result<PathBuf> {
        if image.width() == 0 || image.height() == 0 {
            return Err(anyhow!("refusing to save empty image for {}", label));
        }
        let target_dir = self.dir(dir);
        std::fs::create_dir_all(target_dir)
            .with_context(|| format!("create image dir {}", target_dir.display()))?;
        let path = self.path_for(dir, label);
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .with_context(|| format!("write face image {}", path.display()))?;
        Ok(path)
    }

    fn delete(&self, dir: ImageDir, label: &str) -> Result<bool> {
        let path = self.path_for(dir, label);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(anyhow!("remove {}: {}", path.display(), err)),
        }
    }

    fn clear(&self, dir: ImageDir) -> Result<usize> {
        let target_dir = self.dir(dir);
        let entries = match std::fs::read_dir(target_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(anyhow!("read {}: {}", target_dir.display(), err)),
        };
        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("remove {}", path.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
