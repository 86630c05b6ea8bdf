use crate::error::{MarketError, Result};
use base64::{engine::general_purpose, Engine};
use std::path::Path;
use uuid::Uuid;

/// URL prefix under which the upload directory is served.
pub const UPLOADS_ROUTE: &str = "/uploads";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Webp,
}

impl ImageKind {
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageKind::Jpeg)
        } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(ImageKind::Png)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(ImageKind::Webp)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
            ImageKind::Webp => "webp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
            ImageKind::Webp => "image/webp",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub bytes: Vec<u8>,
    pub kind: ImageKind,
}

/// Decodes a base64 image, optionally wrapped in a `data:` URL, and checks its type and size.
pub fn decode_image(encoded: &str, max_bytes: usize) -> Result<DecodedImage> {
    let payload = match encoded.trim().split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded.trim(),
    };

    let bytes = general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| MarketError::Validation(format!("Image is not valid base64: {}", e)))?;

    if bytes.len() > max_bytes {
        return Err(MarketError::Validation(format!(
            "Image exceeds the {} byte limit",
            max_bytes
        )));
    }

    let kind = ImageKind::detect(&bytes)
        .ok_or_else(|| MarketError::Validation("Only JPEG, PNG and WebP images are accepted".to_string()))?;

    Ok(DecodedImage { bytes, kind })
}

/// Writes the image under `dir` with a generated name and returns its public URL.
pub async fn save_image(dir: &Path, image: &DecodedImage) -> Result<String> {
    tokio::fs::create_dir_all(dir).await?;
    let file_name = format!("{}.{}", Uuid::new_v4(), image.kind.extension());
    tokio::fs::write(dir.join(&file_name), &image.bytes).await?;
    tracing::debug!(file = %file_name, bytes = image.bytes.len(), "image stored");
    Ok(format!("{}/{}", UPLOADS_ROUTE, file_name))
}

/// Deletes a file previously returned by [`save_image`]. Failures are only logged.
pub async fn remove_image(dir: &Path, url: &str) {
    let Some(file_name) = url
        .strip_prefix(UPLOADS_ROUTE)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|name| !name.is_empty() && !name.contains(['/', '\\']) && !name.starts_with('.'))
    else {
        tracing::warn!(url, "not an uploaded image url");
        return;
    };

    if let Err(e) = tokio::fs::remove_file(dir.join(file_name)).await {
        tracing::warn!(file = %file_name, error = %e, "failed to remove image");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn test_detect_image_kind() {
        assert_eq!(ImageKind::detect(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageKind::Jpeg));
        assert_eq!(ImageKind::detect(PNG_HEADER), Some(ImageKind::Png));
        assert_eq!(ImageKind::detect(b"RIFF\0\0\0\0WEBPVP8 "), Some(ImageKind::Webp));
        assert_eq!(ImageKind::detect(b"GIF89a"), None);
    }

    #[test]
    fn test_decode_data_url() {
        let encoded = format!("data:image/png;base64,{}", general_purpose::STANDARD.encode(PNG_HEADER));
        let image = decode_image(&encoded, 1024).unwrap();
        assert_eq!(image.kind, ImageKind::Png);
        assert_eq!(image.bytes, PNG_HEADER);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(decode_image("%%%", 1024).is_err());
        let gif = general_purpose::STANDARD.encode(b"GIF89a....");
        assert!(decode_image(&gif, 1024).is_err());
        let png = general_purpose::STANDARD.encode(PNG_HEADER);
        assert!(decode_image(&png, 4).is_err());
    }

    #[tokio::test]
    async fn test_save_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = DecodedImage {
            bytes: PNG_HEADER.to_vec(),
            kind: ImageKind::Png,
        };
        let url = save_image(dir.path(), &image).await.unwrap();
        assert!(url.starts_with("/uploads/"));
        assert!(url.ends_with(".png"));

        let file_name = url.trim_start_matches("/uploads/");
        assert_eq!(std::fs::read(dir.path().join(file_name)).unwrap(), PNG_HEADER);

        remove_image(dir.path(), &url).await;
        assert!(!dir.path().join(file_name).exists());
    }

    #[tokio::test]
    async fn test_remove_image_stays_inside_upload_dir() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("keep.txt");
        std::fs::write(&outside, b"keep").unwrap();
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();

        remove_image(&uploads, "/uploads/../keep.txt").await;
        remove_image(&uploads, "/elsewhere/keep.txt").await;
        assert!(outside.exists());
    }
}
