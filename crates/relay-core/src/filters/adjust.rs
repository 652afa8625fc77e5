//! In-memory pixel transforms.

use async_trait::async_trait;
use image::imageops::FilterType;
use image::DynamicImage;

use super::map_image;
use crate::envelope::Envelope;
use crate::error::TransformError;
use crate::transform::Transform;

/// Scale to a target box.
///
/// With `keep_aspect_ratio`, the image is scaled by a single factor so it
/// fits the given width and/or height; otherwise missing dimensions keep
/// their original size. With neither dimension set the image is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resize {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub keep_aspect_ratio: bool,
}

impl Resize {
    /// Output dimensions for an input of `width` x `height`.
    pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        if !self.keep_aspect_ratio {
            return (
                self.width.unwrap_or(width).max(1),
                self.height.unwrap_or(height).max(1),
            );
        }

        let scale = match (self.width, self.height) {
            (Some(w), Some(h)) => (w as f64 / width as f64).min(h as f64 / height as f64),
            (Some(w), None) => w as f64 / width as f64,
            (None, Some(h)) => h as f64 / height as f64,
            (None, None) => return (width, height),
        };
        let scaled = |side: u32| ((side as f64 * scale).round() as u32).max(1);
        (scaled(width), scaled(height))
    }
}

#[async_trait]
impl Transform for Resize {
    async fn apply(&self, envelope: &mut Envelope) -> Result<(), TransformError> {
        let resize = *self;
        map_image(envelope, move |image| {
            let (w, h) = resize.target_size(image.width(), image.height());
            if (w, h) == (image.width(), image.height()) {
                image.clone()
            } else {
                image.resize_exact(w, h, FilterType::Triangle)
            }
        })
        .await
    }
}

/// Convert to luminance, optionally expanding back to RGB.
#[derive(Debug, Clone, Copy, Default)]
pub struct Grayscale {
    pub keep_channels: bool,
}

#[async_trait]
impl Transform for Grayscale {
    async fn apply(&self, envelope: &mut Envelope) -> Result<(), TransformError> {
        let keep_channels = self.keep_channels;
        map_image(envelope, move |image| {
            let gray = DynamicImage::ImageLuma8(image.to_luma8());
            if keep_channels {
                DynamicImage::ImageRgb8(gray.to_rgb8())
            } else {
                gray
            }
        })
        .await
    }
}

/// Gaussian blur.
#[derive(Debug, Clone, Copy)]
pub struct Blur {
    pub sigma: f32,
}

#[async_trait]
impl Transform for Blur {
    async fn apply(&self, envelope: &mut Envelope) -> Result<(), TransformError> {
        if self.sigma.is_nan() || self.sigma <= 0.0 {
            return Err(TransformError::failed(format!(
                "blur sigma must be positive, got {}",
                self.sigma
            )));
        }
        let sigma = self.sigma;
        map_image(envelope, move |image| image.blur(sigma)).await
    }
}

/// Mirror left to right.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlipHorizontal;

#[async_trait]
impl Transform for FlipHorizontal {
    async fn apply(&self, envelope: &mut Envelope) -> Result<(), TransformError> {
        map_image(envelope, |image| image.fliph()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use image::{GenericImageView, Rgb, RgbImage};

    fn image_env(image: DynamicImage) -> Envelope {
        Envelope::new("img", Payload::Image(image))
    }

    fn image_of(env: &Envelope) -> &DynamicImage {
        match env.payload() {
            Payload::Image(img) => img,
            other => panic!("expected image, got {}", other.kind()),
        }
    }

    #[test]
    fn test_target_size_keeps_aspect_ratio() {
        let r = Resize {
            width: Some(500),
            height: Some(500),
            keep_aspect_ratio: true,
        };
        assert_eq!(r.target_size(1000, 500), (500, 250));
        assert_eq!(r.target_size(200, 400), (250, 500));

        let width_only = Resize {
            width: Some(100),
            height: None,
            keep_aspect_ratio: true,
        };
        assert_eq!(width_only.target_size(400, 300), (100, 75));
    }

    #[test]
    fn test_target_size_exact() {
        let r = Resize {
            width: Some(64),
            height: None,
            keep_aspect_ratio: false,
        };
        assert_eq!(r.target_size(10, 20), (64, 20));

        let none = Resize {
            width: None,
            height: None,
            keep_aspect_ratio: true,
        };
        assert_eq!(none.target_size(10, 20), (10, 20));
    }

    #[test]
    fn test_target_size_never_zero() {
        let r = Resize {
            width: Some(1),
            height: Some(1),
            keep_aspect_ratio: true,
        };
        assert_eq!(r.target_size(1000, 10), (1, 1));
    }

    #[tokio::test]
    async fn test_resize_applies() {
        let mut env = image_env(DynamicImage::new_rgb8(100, 50));
        Resize {
            width: Some(10),
            height: Some(10),
            keep_aspect_ratio: true,
        }
        .apply(&mut env)
        .await
        .unwrap();
        assert_eq!(image_of(&env).dimensions(), (10, 5));
    }

    #[tokio::test]
    async fn test_grayscale() {
        let mut env = image_env(DynamicImage::new_rgb8(4, 4));
        Grayscale::default().apply(&mut env).await.unwrap();
        assert_eq!(env.summary(), "image 4x4 luma8");

        Grayscale {
            keep_channels: true,
        }
        .apply(&mut env)
        .await
        .unwrap();
        assert_eq!(env.summary(), "image 4x4 rgb8");
    }

    #[tokio::test]
    async fn test_flip_horizontal_mirrors_pixels() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 0, 255]));
        let mut env = image_env(DynamicImage::ImageRgb8(img));

        FlipHorizontal.apply(&mut env).await.unwrap();
        let flipped = image_of(&env).to_rgb8();
        assert_eq!(flipped.get_pixel(0, 0), &Rgb([0, 0, 255]));
        assert_eq!(flipped.get_pixel(1, 0), &Rgb([255, 0, 0]));
    }

    #[tokio::test]
    async fn test_blur_rejects_non_positive_sigma() {
        let mut env = image_env(DynamicImage::new_rgb8(4, 4));
        assert!(Blur { sigma: 0.0 }.apply(&mut env).await.is_err());
        assert!(matches!(env.payload(), Payload::Image(_)));
        Blur { sigma: 1.0 }.apply(&mut env).await.unwrap();
    }

    #[tokio::test]
    async fn test_filters_reject_path_payload() {
        let mut env = Envelope::from_path("/in/a.png");
        let err = FlipHorizontal.apply(&mut env).await.unwrap_err();
        assert!(matches!(
            err,
            TransformError::UnexpectedPayload { found: "path", .. }
        ));
    }

    #[tokio::test]
    async fn test_timed_out_resize_keeps_image_for_retry() {
        use crate::pipeline::retry::{self, RetryPolicy};
        use std::time::Duration;

        let resize = Resize {
            width: Some(2999),
            height: Some(2999),
            keep_aspect_ratio: false,
        };
        let policy = RetryPolicy::default()
            .with_max_attempts(2)
            .with_base_backoff(Duration::from_millis(1))
            .with_timeout(Duration::from_millis(1));
        let mut env = image_env(DynamicImage::new_rgb8(3000, 3000));

        match retry::execute("resize", &resize, &mut env, &policy).await {
            Ok(()) => assert_eq!(image_of(&env).dimensions(), (2999, 2999)),
            Err(err) => {
                assert!(
                    err.history.iter().all(|e| !e.contains("expected image")),
                    "{:?}",
                    err.history
                );
                assert_eq!(image_of(&env).dimensions(), (3000, 3000));
            }
        }
    }
}
