//! Write images back to disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};

use super::with_image;
use crate::envelope::{Envelope, Payload};
use crate::error::{TransformError, TransformResult};
use crate::transform::Transform;

/// `Image` payload in, `Path` payload (the written file) out.
///
/// The file keeps the envelope's original file name, or gets
/// `output_{8 hex}.jpg` when there is none. Setting `format` replaces the
/// extension and picks the encoder.
#[derive(Debug, Clone)]
pub struct Save {
    pub output_dir: PathBuf,
    pub format: Option<String>,
}

impl Save {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            format: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Destination for an envelope whose original file name is `file_name`.
    pub fn destination(&self, file_name: Option<&str>) -> PathBuf {
        let name = match file_name {
            Some(name) if !name.is_empty() => PathBuf::from(name),
            _ => PathBuf::from(format!(
                "output_{}.jpg",
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            )),
        };
        let name = match &self.format {
            Some(ext) => name.with_extension(ext.trim_start_matches('.')),
            None => name,
        };
        self.output_dir.join(name)
    }

    fn write(image: &DynamicImage, path: &Path) -> TransformResult<()> {
        let encode_error = |message: String| TransformError::Encode {
            path: path.to_path_buf(),
            message,
        };
        let format = ImageFormat::from_path(path).map_err(|e| encode_error(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // JPEG has no alpha channel and no 16-bit samples.
        let converted;
        let image = match (format, image) {
            (ImageFormat::Jpeg, DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_)) => image,
            (ImageFormat::Jpeg, _) => {
                converted = DynamicImage::ImageRgb8(image.to_rgb8());
                &converted
            }
            _ => image,
        };

        image
            .save_with_format(path, format)
            .map_err(|e| encode_error(e.to_string()))
    }
}

#[async_trait]
impl Transform for Save {
    async fn apply(&self, envelope: &mut Envelope) -> Result<(), TransformError> {
        let path = self.destination(envelope.meta().file_name());
        let target = path.clone();
        with_image(envelope, move |image| Self::write(image, &target)).await?;

        tracing::debug!("Saved {} -> {:?}", envelope.id().short(12), path);
        envelope
            .labels_mut()
            .insert("output_path".to_string(), path.display().to_string());
        envelope.set_payload(Payload::Path(path));
        Ok(())
    }
}
