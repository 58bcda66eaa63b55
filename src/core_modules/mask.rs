// THEORY:
// The `MaskManager` decides which pixels the detector is allowed to look at.
//
// Two masks are composed with a logical AND:
// 1.  **Static mask**: a user supplied 8-bit image (horizon, buildings, lens
//     vignetting). It rarely changes and is loaded once. When the working image
//     is downsampled the static mask is reduced the same way, keeping a pixel
//     only if its whole 2x2 block was valid.
// 2.  **Adaptive mask**: every K frames the current working image is scanned for
//     saturated pixels. Those pixels and their 8-neighbour halo are excluded
//     until the next refresh, so bright stars, the moon or street lights that
//     bloom from frame to frame never register as motion.
//
// The composed mask is built lazily on the first frame, once the working
// dimensions are known, and rebuilt after `reset` (e.g. a parameter reload).

use crate::core_modules::frame::frame::PixelBuffer;
use crate::error::DetectionError;
use image::{GrayImage, Luma};
use std::path::PathBuf;
use tracing::{Span, debug, warn};

pub const MASK_VALID: u8 = 255;
pub const MASK_EXCLUDED: u8 = 0;

/// Resolved mask options for one detection session.
#[derive(Debug, Clone, Default)]
pub struct MaskSettings {
    pub static_enabled: bool,
    pub static_path: Option<PathBuf>,
    pub adaptive_enabled: bool,
    /// Frames between two adaptive refreshes. Always positive once resolved.
    pub adaptive_interval: u64,
}

pub struct MaskManager {
    settings: MaskSettings,
    /// The static mask at its source resolution.
    static_source: Option<GrayImage>,
    /// The static mask fitted to the working resolution.
    static_mask: Option<GrayImage>,
    adaptive_mask: Option<GrayImage>,
    combined: Option<GrayImage>,
    dimensions: Option<(u32, u32)>,
    frames_since_refresh: u64,
    span: Span,
}

impl MaskManager {
    /// Loads the static mask named in the settings. A missing or unreadable file
    /// disables the static mask for this session instead of failing.
    pub fn new(mut settings: MaskSettings, span: Span) -> Self {
        let static_source = if settings.static_enabled {
            match settings.static_path.as_ref() {
                Some(path) => match image::open(path) {
                    Ok(image) => Some(image.to_luma8()),
                    Err(err) => {
                        span.in_scope(|| {
                            warn!(path = %path.display(), error = %err, "cannot load static mask, masking disabled")
                        });
                        None
                    }
                },
                None => {
                    span.in_scope(|| warn!("static mask enabled without a path, masking disabled"));
                    None
                }
            }
        } else {
            None
        };
        settings.static_enabled = static_source.is_some();
        Self::build(settings, static_source, span)
    }

    /// Uses an in-memory static mask instead of a file.
    pub fn with_static_mask(mut settings: MaskSettings, mask: GrayImage, span: Span) -> Self {
        settings.static_enabled = true;
        Self::build(settings, Some(mask), span)
    }

    fn build(mut settings: MaskSettings, static_source: Option<GrayImage>, span: Span) -> Self {
        settings.adaptive_interval = settings.adaptive_interval.max(1);
        Self {
            settings,
            static_source,
            static_mask: None,
            adaptive_mask: None,
            combined: None,
            dimensions: None,
            frames_since_refresh: 0,
            span,
        }
    }

    /// Forgets every derived mask; the next frame rebuilds them.
    pub fn reset(&mut self) {
        self.static_mask = None;
        self.adaptive_mask = None;
        self.combined = None;
        self.dimensions = None;
        self.frames_since_refresh = 0;
    }

    /// Returns the mask to apply to `working`, refreshing the adaptive part when due.
    pub fn mask_for(&mut self, working: &PixelBuffer) -> Result<&GrayImage, DetectionError> {
        let dims = working.dimensions();

        if self.dimensions != Some(dims) {
            self.static_mask = self.fit_static(dims)?;
            self.dimensions = Some(dims);
            self.adaptive_mask = None;
            self.combined = None;
            self.frames_since_refresh = 0;
        }

        if self.settings.adaptive_enabled {
            if self.adaptive_mask.is_none() || self.frames_since_refresh >= self.settings.adaptive_interval {
                let mask = saturated_pixel_mask(working);
                let excluded = mask.as_raw().iter().filter(|&&v| v == MASK_EXCLUDED).count();
                self.span
                    .in_scope(|| debug!(excluded, "refreshed adaptive bright-pixel mask"));
                self.adaptive_mask = Some(mask);
                self.combined = None;
                self.frames_since_refresh = 0;
            }
            self.frames_since_refresh += 1;
        }

        let static_mask = &self.static_mask;
        let adaptive_mask = &self.adaptive_mask;
        let combined: &GrayImage = self
            .combined
            .get_or_insert_with(|| compose(dims, static_mask.as_ref(), adaptive_mask.as_ref()));
        Ok(combined)
    }

    fn fit_static(&self, (width, height): (u32, u32)) -> Result<Option<GrayImage>, DetectionError> {
        let Some(source) = self.static_source.as_ref() else {
            return Ok(None);
        };
        if source.dimensions() == (width, height) {
            return Ok(Some(source.clone()));
        }
        if source.width() / 2 == width && source.height() / 2 == height {
            return Ok(Some(GrayImage::from_fn(width, height, |x, y| {
                let block_valid = (0..2).all(|dy| {
                    (0..2).all(|dx| source.get_pixel(x * 2 + dx, y * 2 + dy).0[0] != MASK_EXCLUDED)
                });
                Luma([if block_valid { MASK_VALID } else { MASK_EXCLUDED }])
            })));
        }
        Err(DetectionError::GeometryMismatch {
            what: "static mask",
            expected_width: width,
            expected_height: height,
            found_width: source.width(),
            found_height: source.height(),
        })
    }
}

fn compose((width, height): (u32, u32), static_mask: Option<&GrayImage>, adaptive_mask: Option<&GrayImage>) -> GrayImage {
    let mut combined = GrayImage::from_pixel(width, height, Luma([MASK_VALID]));
    for layer in [static_mask, adaptive_mask].into_iter().flatten() {
        for (out, value) in combined.pixels_mut().zip(layer.pixels()) {
            if value.0[0] == MASK_EXCLUDED {
                out.0[0] = MASK_EXCLUDED;
            }
        }
    }
    combined
}

/// Excludes saturated pixels together with their 8-neighbour halo.
pub fn saturated_pixel_mask(working: &PixelBuffer) -> GrayImage {
    let (width, height) = working.dimensions();
    let saturation = working.saturation();
    let mut mask = GrayImage::from_pixel(width, height, Luma([MASK_VALID]));
    for y in 0..height {
        for x in 0..width {
            if working.value(x, y) < saturation {
                continue;
            }
            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    mask.put_pixel(nx, ny, Luma([MASK_EXCLUDED]));
                }
            }
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn working(width: u32, height: u32, bright: &[(u32, u32)]) -> PixelBuffer {
        let mut image = GrayImage::from_pixel(width, height, Luma([20]));
        for &(x, y) in bright {
            image.put_pixel(x, y, Luma([255]));
        }
        PixelBuffer::Gray8(image)
    }

    #[test]
    fn no_masks_means_everything_is_valid() {
        let mut manager = MaskManager::new(MaskSettings::default(), Span::none());
        let mask = manager.mask_for(&working(6, 6, &[])).unwrap();
        assert!(mask.pixels().all(|p| p.0[0] == MASK_VALID));
    }

    #[test]
    fn adaptive_mask_excludes_saturated_pixel_and_halo() {
        let settings = MaskSettings {
            adaptive_enabled: true,
            adaptive_interval: 10,
            ..MaskSettings::default()
        };
        let mut manager = MaskManager::new(settings, Span::none());
        let mask = manager.mask_for(&working(8, 8, &[(4, 4)])).unwrap();
        assert_eq!(mask.get_pixel(4, 4).0[0], MASK_EXCLUDED);
        assert_eq!(mask.get_pixel(3, 5).0[0], MASK_EXCLUDED);
        assert_eq!(mask.get_pixel(6, 4).0[0], MASK_VALID);
    }

    #[test]
    fn adaptive_mask_refreshes_only_on_interval() {
        let settings = MaskSettings {
            adaptive_enabled: true,
            adaptive_interval: 2,
            ..MaskSettings::default()
        };
        let mut manager = MaskManager::new(settings, Span::none());
        manager.mask_for(&working(8, 8, &[(1, 1)])).unwrap();
        // Second frame: still inside the interval, the old exclusion holds.
        let mask = manager.mask_for(&working(8, 8, &[])).unwrap();
        assert_eq!(mask.get_pixel(1, 1).0[0], MASK_EXCLUDED);
        // Third frame: refreshed from a clean image.
        let mask = manager.mask_for(&working(8, 8, &[])).unwrap();
        assert_eq!(mask.get_pixel(1, 1).0[0], MASK_VALID);
    }

    #[test]
    fn static_mask_is_fitted_to_downsampled_frames() {
        let mut source = GrayImage::from_pixel(8, 8, Luma([MASK_VALID]));
        source.put_pixel(5, 5, Luma([MASK_EXCLUDED]));
        let mut manager = MaskManager::with_static_mask(MaskSettings::default(), source, Span::none());
        let mask = manager.mask_for(&working(4, 4, &[])).unwrap();
        assert_eq!(mask.get_pixel(2, 2).0[0], MASK_EXCLUDED);
        assert_eq!(mask.get_pixel(1, 1).0[0], MASK_VALID);
    }

    #[test]
    fn static_mask_of_wrong_size_is_a_geometry_error() {
        let source = GrayImage::from_pixel(5, 5, Luma([MASK_VALID]));
        let mut manager = MaskManager::with_static_mask(MaskSettings::default(), source, Span::none());
        let result = manager.mask_for(&working(8, 8, &[]));
        assert!(matches!(result, Err(DetectionError::GeometryMismatch { .. })));
    }

    #[test]
    fn missing_mask_file_disables_static_mask() {
        let settings = MaskSettings {
            static_enabled: true,
            static_path: Some(PathBuf::from("/nonexistent/mask.png")),
            ..MaskSettings::default()
        };
        let mut manager = MaskManager::new(settings, Span::none());
        assert!(manager.mask_for(&working(4, 4, &[])).is_ok());
    }
}
