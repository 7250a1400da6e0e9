use std::path::{Path, PathBuf};

pub const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "webp", "bmp", "tiff", "tif", "gif"];

pub fn is_image_file(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Image files directly inside `dir`, sorted by file name.
pub fn scan_images(dir: impl AsRef<Path>) -> std::io::Result<Vec<PathBuf>> {
    let mut images = vec![];
    for entry in std::fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        if path.is_file() && is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    tracing::debug!("found {} images in {}", images.len(), dir.as_ref().display());

    Ok(images)
}

/// The caption file that sits next to an image: same stem, `.txt` extension.
pub fn sidecar_path(image: impl AsRef<Path>) -> PathBuf {
    image.as_ref().with_extension("txt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_image_file() {
        assert!(is_image_file("a/b/photo.JPG"));
        assert!(is_image_file("scan.tif"));
        assert!(is_image_file("anim.Gif"));
        assert!(!is_image_file("notes.txt"));
        assert!(!is_image_file("model.gguf"));
        assert!(!is_image_file("jpg"));
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(sidecar_path("/d/cat.final.png"), PathBuf::from("/d/cat.final.txt"));
    }

    #[test]
    fn test_scan_images_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.WEBP", "c.txt", "d.jpeg"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.png")).unwrap();

        let names: Vec<String> = scan_images(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.WEBP", "b.png", "d.jpeg"]);
    }
}
