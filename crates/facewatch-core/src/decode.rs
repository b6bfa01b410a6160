//! Image decode boundary.
//!
//! Only PNG, JPEG, GIF and BMP are accepted: the declared filename extension
//! must be on the whitelist and the sniffed content must be one of those
//! formats too.

use image::{DynamicImage, ImageFormat, ImageReader};
use std::io::Cursor;
use thiserror::Error;

/// Filename extensions accepted for upload, lowercase.
pub const ALLOWED_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "bmp"];

/// Largest accepted upload.
pub const MAX_IMAGE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("image is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("image dimensions are zero")]
    ZeroDimensions,
}

/// Whether `filename` carries a whitelisted extension.
pub fn allowed_file(filename: &str) -> bool {
    extension(filename).is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}

fn extension(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

fn is_allowed_format(format: ImageFormat) -> bool {
    matches!(
        format,
        ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Gif | ImageFormat::Bmp
    )
}

/// Decode uploaded bytes, using `filename` as the declared format.
pub fn decode_image(bytes: &[u8], filename: &str) -> Result<DynamicImage, DecodeError> {
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(DecodeError::TooLarge {
            size: bytes.len(),
            limit: MAX_IMAGE_BYTES,
        });
    }

    if !allowed_file(filename) {
        return Err(DecodeError::UnsupportedFormat(filename.to_string()));
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| DecodeError::Decode(e.to_string()))?;

    match reader.format() {
        Some(format) if is_allowed_format(format) => {}
        Some(format) => {
            return Err(DecodeError::UnsupportedFormat(format!("{format:?}")));
        }
        None => return Err(DecodeError::Decode("unrecognized image data".into())),
    }

    let image = reader
        .decode()
        .map_err(|e| DecodeError::Decode(e.to_string()))?;

    if image.width() == 0 || image.height() == 0 {
        return Err(DecodeError::ZeroDimensions);
    }

    tracing::debug!(
        filename,
        width = image.width(),
        height = image.height(),
        "decoded image"
    );
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn encoded(format: ImageFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, Rgb([200, 10, 10])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    #[test]
    fn test_allowed_file() {
        assert!(allowed_file("face.png"));
        assert!(allowed_file("FACE.JPG"));
        assert!(allowed_file("archive.tar.jpeg"));
        assert!(!allowed_file("face.tiff"));
        assert!(!allowed_file("png"));
        assert!(!allowed_file(""));
    }

    #[test]
    fn test_decode_png() {
        let image = decode_image(&encoded(ImageFormat::Png), "probe.png").unwrap();
        assert_eq!((image.width(), image.height()), (8, 6));
    }

    #[test]
    fn test_decode_bmp_with_jpg_name() {
        // Extension gates the upload, content decides the decoder.
        let image = decode_image(&encoded(ImageFormat::Bmp), "probe.jpg").unwrap();
        assert_eq!(image.width(), 8);
    }

    #[test]
    fn test_rejects_unlisted_extension() {
        let err = decode_image(&encoded(ImageFormat::Png), "probe.webp").unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_rejects_garbage() {
        let err = decode_image(b"definitely not an image", "probe.png").unwrap_err();
        assert!(matches!(err, DecodeError::Decode(_)));
    }

    #[test]
    fn test_rejects_oversized_upload() {
        let bytes = vec![0u8; MAX_IMAGE_BYTES + 1];
        let err = decode_image(&bytes, "probe.png").unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge { size, .. } if size == MAX_IMAGE_BYTES + 1));
    }
}
