use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{imageops::FilterType, GenericImageView, ImageFormat};
use std::{io::Cursor, path::Path};

pub const DEFAULT_MAX_IMAGE_DIM: u32 = 1280;

/// Decode an image, shrink it to fit `max_dim` keeping its aspect ratio,
/// and return it as a base64 PNG data URI.
#[tracing::instrument(err(Debug), skip_all, fields(path = %path.as_ref().display()))]
pub fn image_to_data_uri(path: impl AsRef<Path>, max_dim: u32) -> anyhow::Result<String> {
    let image = image::open(path.as_ref())?;
    let image = image::DynamicImage::ImageRgb8(image.to_rgb8());

    let (width, height) = image.dimensions();
    let image = if width > max_dim || height > max_dim {
        let scale = max_dim as f64 / width.max(height) as f64;
        let new_width = ((width as f64 * scale) as u32).max(1);
        let new_height = ((height as f64 * scale) as u32).max(1);
        tracing::debug!(
            "resize image {}x{} -> {}x{}",
            width,
            height,
            new_width,
            new_height
        );
        image.resize_exact(new_width, new_height, FilterType::Lanczos3)
    } else {
        image
    };

    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;

    Ok(format!(
        "data:image/png;base64,{}",
        STANDARD.encode(buffer.into_inner())
    ))
}
