use serde::Serialize;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModelFile {
    pub name: String,
    pub path: PathBuf,
}

fn is_gguf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

/// Vision encoders (projectors) are `.gguf` files with "mmproj" in their name.
pub fn is_vision_encoder(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    is_gguf(path)
        && path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase().contains("mmproj"))
            .unwrap_or(false)
}

fn gguf_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("skip model dir {}: {}", dir.display(), e);
            return vec![];
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_gguf(path))
        .collect();
    files.sort();
    files
}

pub fn find_vision_encoder(dir: impl AsRef<Path>) -> Option<PathBuf> {
    gguf_files(dir.as_ref())
        .into_iter()
        .find(|path| is_vision_encoder(path))
}

/// Language-model GGUF files across `dirs`. A file name seen in an earlier
/// directory hides later ones.
pub fn scan_models<P: AsRef<Path>>(dirs: &[P]) -> Vec<ModelFile> {
    let mut seen = HashSet::new();
    let mut models = vec![];

    for dir in dirs {
        for path in gguf_files(dir.as_ref()) {
            if is_vision_encoder(&path) {
                continue;
            }
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            if seen.insert(name.clone()) {
                models.push(ModelFile { name, path });
            }
        }
    }

    models.sort_by(|a, b| a.name.cmp(&b.name));
    models
}

/// The model directory first, then user-configured extra paths, without repeats.
pub fn model_search_dirs(model_dir: impl AsRef<Path>, extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs = vec![model_dir.as_ref().to_path_buf()];
    for dir in extra {
        if !dirs.contains(dir) {
            dirs.push(dir.clone());
        }
    }
    dirs
}

pub fn model_file_exists(dir: impl AsRef<Path>, filename: &str) -> bool {
    dir.as_ref().join(filename).is_file()
}
