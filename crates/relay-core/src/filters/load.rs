//! Decode an image file into memory.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::DynamicImage;

use crate::envelope::{Envelope, Payload};
use crate::error::{TransformError, TransformResult};
use crate::transform::Transform;

/// `Path` payload in, `Image` payload out.
///
/// The format is sniffed from the file content, falling back to the
/// extension, so a PNG saved as `.jpg` still decodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Load;

impl Load {
    fn decode(path: &Path) -> TransformResult<DynamicImage> {
        let bytes = std::fs::read(path)?;
        let reader = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| TransformError::Decode {
                path: path.to_path_buf(),
                message: format!("Cannot detect image format: {}", e),
            })?;

        let reader = match reader.format() {
            Some(_) => reader,
            None => {
                let format = image::ImageFormat::from_path(path).map_err(|_| {
                    TransformError::Decode {
                        path: path.to_path_buf(),
                        message: "unrecognized image format".to_string(),
                    }
                })?;
                let mut reader = reader;
                reader.set_format(format);
                reader
            }
        };

        reader.decode().map_err(|e| TransformError::Decode {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Transform for Load {
    async fn apply(&self, envelope: &mut Envelope) -> Result<(), TransformError> {
        let path: PathBuf = match envelope.payload() {
            Payload::Path(path) => path.clone(),
            other => {
                return Err(TransformError::UnexpectedPayload {
                    expected: "path",
                    found: other.kind(),
                })
            }
        };

        let image = tokio::task::spawn_blocking(move || Self::decode(&path))
            .await
            .map_err(|e| TransformError::Join(e.to_string()))??;

        tracing::trace!(
            "Loaded {} ({}x{})",
            envelope.id().short(12),
            image.width(),
            image.height()
        );
        envelope.set_payload(Payload::Image(image));
        Ok(())
    }
}
