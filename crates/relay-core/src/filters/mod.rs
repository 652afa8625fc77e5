//! Image transforms used as pipeline stages.
//!
//! Pixel work runs on the blocking pool so workers of other stages keep
//! moving. Every filter expects a specific payload variant and fails with
//! [`TransformError::UnexpectedPayload`] otherwise, leaving the envelope
//! untouched.

mod adjust;
mod load;
mod save;

pub use adjust::{Blur, FlipHorizontal, Grayscale, Resize};
pub use load::Load;
pub use save::Save;

use std::path::PathBuf;
use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, Payload};
use crate::error::{TransformError, TransformResult};
use crate::transform::Transform;

/// Filter selection as written in configuration files.
///
/// ```toml
/// [stages.filter]
/// kind = "resize"
/// width = 500
/// height = 500
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterSpec {
    Load,
    Resize {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
        #[serde(default = "default_true")]
        keep_aspect_ratio: bool,
    },
    Grayscale {
        #[serde(default)]
        keep_channels: bool,
    },
    Blur {
        #[serde(default = "default_sigma")]
        sigma: f32,
    },
    FlipHorizontal,
    Save {
        /// Defaults to the run's output directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_dir: Option<PathBuf>,
        /// Output extension, e.g. "png"; keeps the input format when unset
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

fn default_sigma() -> f32 {
    1.2
}

impl FilterSpec {
    /// Instantiate the filter. `default_output` is used by `save` when the
    /// config names no directory of its own.
    pub fn build(&self, default_output: &std::path::Path) -> Arc<dyn Transform> {
        match self {
            FilterSpec::Load => Arc::new(Load),
            FilterSpec::Resize {
                width,
                height,
                keep_aspect_ratio,
            } => Arc::new(Resize {
                width: *width,
                height: *height,
                keep_aspect_ratio: *keep_aspect_ratio,
            }),
            FilterSpec::Grayscale { keep_channels } => Arc::new(Grayscale {
                keep_channels: *keep_channels,
            }),
            FilterSpec::Blur { sigma } => Arc::new(Blur { sigma: *sigma }),
            FilterSpec::FlipHorizontal => Arc::new(FlipHorizontal),
            FilterSpec::Save { output_dir, format } => Arc::new(Save {
                output_dir: output_dir
                    .clone()
                    .unwrap_or_else(|| default_output.to_path_buf()),
                format: format.clone(),
            }),
        }
    }

    /// Short name used for default stage names.
    pub fn kind(&self) -> &'static str {
        match self {
            FilterSpec::Load => "load",
            FilterSpec::Resize { .. } => "resize",
            FilterSpec::Grayscale { .. } => "grayscale",
            FilterSpec::Blur { .. } => "blur",
            FilterSpec::FlipHorizontal => "flip_horizontal",
            FilterSpec::Save { .. } => "save",
        }
    }
}

/// Move the image out of `envelope`, or fail without touching it.
fn take_image(envelope: &mut Envelope) -> TransformResult<DynamicImage> {
    match envelope.take_payload() {
        Payload::Image(image) => Ok(image),
        other => {
            let found = other.kind();
            envelope.set_payload(other);
            Err(TransformError::UnexpectedPayload {
                expected: "image",
                found,
            })
        }
    }
}

/// Puts the taken image back into the envelope when dropped, unless
/// [`RestoreImage::disarm`] ran first.
struct RestoreImage<'a> {
    envelope: &'a mut Envelope,
    image: Option<Arc<DynamicImage>>,
}

impl RestoreImage<'_> {
    fn disarm(mut self) {
        self.image = None;
    }
}

impl Drop for RestoreImage<'_> {
    fn drop(&mut self) {
        if let Some(image) = self.image.take() {
            // A cancelled blocking task may still hold its reference.
            let image = Arc::try_unwrap(image).unwrap_or_else(|shared| (*shared).clone());
            self.envelope.set_payload(Payload::Image(image));
        }
    }
}

/// Run `f` on the envelope's image on the blocking pool.
///
/// The image is back in the envelope afterwards whatever happens: on
/// success, on error, on a panic inside `f`, and when the returned future
/// is dropped before the blocking task finishes (e.g. by a timeout).
pub(crate) async fn with_image<T, F>(envelope: &mut Envelope, f: F) -> TransformResult<T>
where
    F: FnOnce(&DynamicImage) -> TransformResult<T> + Send + 'static,
    T: Send + 'static,
{
    let image = Arc::new(take_image(envelope)?);
    let guard = RestoreImage {
        envelope,
        image: Some(Arc::clone(&image)),
    };
    let result = tokio::task::spawn_blocking(move || f(&image)).await;
    drop(guard);
    result.map_err(|e| TransformError::Join(e.to_string()))?
}

/// Replace the image payload with `f(image)`, computed on the blocking pool.
///
/// The envelope keeps its original image unless `f` completes.
pub(crate) async fn map_image<F>(envelope: &mut Envelope, f: F) -> TransformResult<()>
where
    F: FnOnce(&DynamicImage) -> DynamicImage + Send + 'static,
{
    let image = Arc::new(take_image(envelope)?);
    let mut guard = RestoreImage {
        envelope,
        image: Some(Arc::clone(&image)),
    };
    let mapped = tokio::task::spawn_blocking(move || f(&image))
        .await
        .map_err(|e| TransformError::Join(e.to_string()))?;

    guard.envelope.set_payload(Payload::Image(mapped));
    guard.disarm();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_spec_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            filter: FilterSpec,
        }

        let w: Wrapper = toml::from_str(
            r#"
            [filter]
            kind = "resize"
            width = 500
            "#,
        )
        .unwrap();
        assert_eq!(
            w.filter,
            FilterSpec::Resize {
                width: Some(500),
                height: None,
                keep_aspect_ratio: true
            }
        );

        let w: Wrapper = toml::from_str("[filter]\nkind = \"flip_horizontal\"\n").unwrap();
        assert_eq!(w.filter, FilterSpec::FlipHorizontal);
        assert_eq!(w.filter.kind(), "flip_horizontal");
    }

    #[test]
    fn test_unknown_filter_kind_is_rejected() {
        let result: Result<FilterSpec, _> = serde_json::from_str(r#"{"kind":"sharpen"}"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_take_image_restores_other_payloads() {
        let mut env = Envelope::new("x", Payload::Text("hi".into()));
        let err = map_image(&mut env, |img| img.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            TransformError::UnexpectedPayload {
                expected: "image",
                found: "text"
            }
        ));
        assert!(matches!(env.payload(), Payload::Text(t) if t == "hi"));
    }

    fn image_env(width: u32, height: u32) -> Envelope {
        Envelope::new("img", Payload::Image(DynamicImage::new_rgb8(width, height)))
    }

    fn dims(env: &Envelope) -> Option<(u32, u32)> {
        match env.payload() {
            Payload::Image(img) => Some((img.width(), img.height())),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_cancelled_map_keeps_image() {
        let mut env = image_env(8, 6);
        let slow = map_image(&mut env, |img| {
            std::thread::sleep(std::time::Duration::from_millis(200));
            img.fliph()
        });
        let result = tokio::time::timeout(std::time::Duration::from_millis(10), slow).await;
        assert!(result.is_err());
        assert_eq!(dims(&env), Some((8, 6)));
    }

    #[tokio::test]
    async fn test_panicking_map_keeps_image() {
        let mut env = image_env(8, 6);
        let err = map_image(&mut env, |_| panic!("boom")).await.unwrap_err();
        assert!(matches!(err, TransformError::Join(_)));
        assert_eq!(dims(&env), Some((8, 6)));
    }

    #[tokio::test]
    async fn test_with_image_restores_on_error() {
        let mut env = image_env(4, 4);
        let err = with_image(&mut env, |_| -> TransformResult<()> {
            Err(TransformError::failed("disk full"))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert_eq!(dims(&env), Some((4, 4)));

        let width = with_image(&mut env, |img| Ok(img.width())).await.unwrap();
        assert_eq!(width, 4);
        assert_eq!(dims(&env), Some((4, 4)));
    }
}
