use model_catalog::sidecar_path;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;

/// Caption stored next to `image`, trimmed. `None` when there is no sidecar.
pub async fn read_sidecar(image: &Path) -> std::io::Result<Option<String>> {
    match fs::read_to_string(sidecar_path(image)).await {
        Ok(text) => Ok(Some(text.trim().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Writes `caption` verbatim and returns the sidecar path.
pub async fn write_sidecar(image: &Path, caption: &str) -> std::io::Result<PathBuf> {
    let path = sidecar_path(image);
    fs::write(&path, caption.as_bytes()).await?;
    Ok(path)
}

pub async fn has_sidecar(image: &Path) -> bool {
    fs::try_exists(sidecar_path(image)).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("cat.jpg");
        std::fs::write(&image, b"jpg").unwrap();

        assert_eq!(read_sidecar(&image).await.unwrap(), None);
        assert!(!has_sidecar(&image).await);

        let caption = "sks, a tabby cat, sitting on a windowsill";
        let path = write_sidecar(&image, caption).await.unwrap();
        assert_eq!(path, dir.path().join("cat.txt"));
        assert!(has_sidecar(&image).await);
        assert_eq!(read_sidecar(&image).await.unwrap().as_deref(), Some(caption));
    }

    #[test_log::test(tokio::test)]
    async fn test_read_trims_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("dog.png");
        std::fs::write(dir.path().join("dog.txt"), "  a dog\n\n").unwrap();
        assert_eq!(read_sidecar(&image).await.unwrap().as_deref(), Some("a dog"));
    }
}
