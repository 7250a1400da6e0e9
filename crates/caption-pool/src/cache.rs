use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

/// Most recently accepted caption per image. Entries are never evicted,
/// only cleared with the workspace.
#[derive(Debug, Default, Clone)]
pub struct CaptionCache {
    captions: HashMap<PathBuf, String>,
}

impl CaptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image: impl Into<PathBuf>, caption: impl Into<String>) {
        self.captions.insert(image.into(), caption.into());
    }

    pub fn get(&self, image: &Path) -> Option<&str> {
        self.captions.get(image).map(String::as_str)
    }

    pub fn contains(&self, image: &Path) -> bool {
        self.captions.contains_key(image)
    }

    pub fn remove(&mut self, image: &Path) -> Option<String> {
        self.captions.remove(image)
    }

    pub fn clear(&mut self) {
        self.captions.clear();
    }

    pub fn len(&self) -> usize {
        self.captions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &String)> {
        self.captions.iter()
    }
}
