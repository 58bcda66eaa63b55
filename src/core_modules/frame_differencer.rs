// THEORY:
// The `FrameDifferencer` is the temporal analysis layer of the detector. It knows
// *where* something changed between two consecutive frames, nothing more.
//
// Key architectural principles:
// 1.  **Masked Difference**: Both frames are masked before differencing, so an
//     excluded pixel can never register motion.
// 2.  **Adaptive Threshold**: The difference image is summarised by its mean and
//     standard deviation over the valid pixels. The binarisation threshold is
//     `5 * round(stddev) + 5`; a noisy night raises the bar, a quiet one lowers
//     it, and an identical frame pair can never produce foreground.
// 3.  **Lone Pixel Removal**: A foreground pixel with no foreground neighbour is
//     shot noise. It is removed through a fixed 3x3 kernel.
// 4.  **Two-Frame Persistence**: The output motion map is the AND of this frame's
//     threshold map with the previous one. Only pixels that changed in two
//     consecutive differences survive, which rejects single-frame spikes the
//     lone pixel filter missed.

use crate::core_modules::frame::frame::PixelBuffer;
use crate::core_modules::mask::MASK_EXCLUDED;
use crate::error::DetectionError;
use image::{GrayImage, Luma};

pub const FOREGROUND: u8 = 255;
pub const BACKGROUND: u8 = 0;
/// Lowest threshold the adaptive rule may produce.
pub const MIN_THRESHOLD: u8 = 5;

/// Neighbourhood inspected around a foreground pixel; the centre is ignored.
const LONE_PIXEL_KERNEL: [[u8; 3]; 3] = [[1, 1, 1], [1, 0, 1], [1, 1, 1]];

/// Noise statistics of one masked difference image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DifferenceStats {
    pub mean: f64,
    pub std_dev: f64,
    pub threshold: u8,
}

/// Everything the differencer learned from one frame.
#[derive(Debug, Clone)]
pub struct DifferenceOutput {
    pub threshold_map: GrayImage,
    /// Pixels that were foreground in this and the previous threshold map.
    pub motion_map: GrayImage,
    pub stats: DifferenceStats,
}

fn check_geometry(what: &'static str, expected: (u32, u32), found: (u32, u32)) -> Result<(), DetectionError> {
    if expected == found {
        return Ok(());
    }
    Err(DetectionError::GeometryMismatch {
        what,
        expected_width: expected.0,
        expected_height: expected.1,
        found_width: found.0,
        found_height: found.1,
    })
}

/// Masked absolute difference scaled to 8 bits.
pub fn masked_difference(
    current: &PixelBuffer,
    previous: &PixelBuffer,
    mask: &GrayImage,
) -> Result<GrayImage, DetectionError> {
    let dims = current.dimensions();
    check_geometry("previous frame", dims, previous.dimensions())?;
    check_geometry("mask", dims, mask.dimensions())?;

    let diff: Vec<u16> = current
        .samples()
        .zip(previous.samples())
        .zip(mask.as_raw().iter())
        .map(|((c, p), &m)| if m == MASK_EXCLUDED { 0 } else { c.abs_diff(p) })
        .collect();

    let width = dims.0 as usize;
    let image = match current {
        PixelBuffer::Gray8(_) => {
            GrayImage::from_fn(dims.0, dims.1, |x, y| Luma([diff[y as usize * width + x as usize] as u8]))
        }
        PixelBuffer::Gray16 { .. } => {
            // 16-bit differences are stretched over 0..=255 between their extremes.
            let min = diff.iter().copied().min().unwrap_or(0) as u32;
            let max = diff.iter().copied().max().unwrap_or(0) as u32;
            let span = max - min;
            GrayImage::from_fn(dims.0, dims.1, |x, y| {
                if span == 0 {
                    return Luma([0]);
                }
                let v = diff[y as usize * width + x as usize] as u32;
                Luma([(((v - min) * 255) / span) as u8])
            })
        }
    };
    Ok(image)
}

/// Mean, standard deviation and adaptive threshold over the valid pixels.
pub fn difference_stats(difference: &GrayImage, mask: &GrayImage) -> DifferenceStats {
    let mut count = 0u64;
    let mut sum = 0f64;
    let mut sum_sq = 0f64;
    for (d, m) in difference.pixels().zip(mask.pixels()) {
        if m.0[0] == MASK_EXCLUDED {
            continue;
        }
        let v = d.0[0] as f64;
        count += 1;
        sum += v;
        sum_sq += v * v;
    }
    let (mean, std_dev) = if count == 0 {
        (0.0, 0.0)
    } else {
        let mean = sum / count as f64;
        let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
        (mean, variance.sqrt())
    };
    let threshold = (5.0 * std_dev.round() + 5.0).clamp(MIN_THRESHOLD as f64, 255.0) as u8;
    DifferenceStats {
        mean,
        std_dev,
        threshold,
    }
}

/// Zeroes every foreground pixel whose 8 neighbours are all background.
pub fn remove_lone_pixels(map: &GrayImage) -> GrayImage {
    let (width, height) = map.dimensions();
    let mut cleaned = map.clone();
    for y in 0..height {
        for x in 0..width {
            if map.get_pixel(x, y).0[0] == BACKGROUND {
                continue;
            }
            let mut support = 0u32;
            for (ky, row) in LONE_PIXEL_KERNEL.iter().enumerate() {
                for (kx, &weight) in row.iter().enumerate() {
                    let nx = x as i64 + kx as i64 - 1;
                    let ny = y as i64 + ky as i64 - 1;
                    if weight == 0 || nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                        continue;
                    }
                    if map.get_pixel(nx as u32, ny as u32).0[0] != BACKGROUND {
                        support += weight as u32;
                    }
                }
            }
            if support == 0 {
                cleaned.put_pixel(x, y, Luma([BACKGROUND]));
            }
        }
    }
    cleaned
}

/// Binarised, de-speckled difference of two frames.
pub fn threshold_difference(
    current: &PixelBuffer,
    previous: &PixelBuffer,
    mask: &GrayImage,
) -> Result<(GrayImage, DifferenceStats), DetectionError> {
    let difference = masked_difference(current, previous, mask)?;
    let stats = difference_stats(&difference, mask);
    let binary = GrayImage::from_fn(difference.width(), difference.height(), |x, y| {
        if difference.get_pixel(x, y).0[0] > stats.threshold {
            Luma([FOREGROUND])
        } else {
            Luma([BACKGROUND])
        }
    });
    Ok((remove_lone_pixels(&binary), stats))
}

fn bitwise_and(a: &GrayImage, b: &GrayImage) -> GrayImage {
    GrayImage::from_fn(a.width(), a.height(), |x, y| Luma([a.get_pixel(x, y).0[0] & b.get_pixel(x, y).0[0]]))
}

/// Stateful differencer holding the previous working image and threshold map.
#[derive(Default)]
pub struct FrameDifferencer {
    previous_frame: Option<PixelBuffer>,
    previous_threshold: Option<GrayImage>,
}

impl FrameDifferencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.previous_frame = None;
        self.previous_threshold = None;
    }

    /// Returns `None` while there is no compatible previous frame to compare against.
    pub fn process(
        &mut self,
        current: &PixelBuffer,
        mask: &GrayImage,
    ) -> Result<Option<DifferenceOutput>, DetectionError> {
        check_geometry("mask", current.dimensions(), mask.dimensions())?;

        let compatible = self.previous_frame.as_ref().is_some_and(|previous| {
            previous.dimensions() == current.dimensions() && previous.bit_depth() == current.bit_depth()
        });
        if !compatible {
            self.previous_frame = Some(current.clone());
            self.previous_threshold = None;
            return Ok(None);
        }

        let Some(previous) = self.previous_frame.replace(current.clone()) else {
            return Ok(None);
        };
        let (threshold_map, stats) = threshold_difference(current, &previous, mask)?;
        let motion_map = match self.previous_threshold.as_ref() {
            Some(previous_threshold) => bitwise_and(&threshold_map, previous_threshold),
            None => GrayImage::new(threshold_map.width(), threshold_map.height()),
        };
        self.previous_threshold = Some(threshold_map.clone());

        Ok(Some(DifferenceOutput {
            threshold_map,
            motion_map,
            stats,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageBuffer;

    fn full_mask(width: u32, height: u32) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([255]))
    }

    fn frame_with_square(width: u32, height: u32, x0: u32, y0: u32, size: u32) -> PixelBuffer {
        PixelBuffer::Gray8(GrayImage::from_fn(width, height, |x, y| {
            let inside = x >= x0 && x < x0 + size && y >= y0 && y < y0 + size;
            Luma([if inside { 200 } else { 10 }])
        }))
    }

    fn foreground_count(map: &GrayImage) -> usize {
        map.pixels().filter(|p| p.0[0] != BACKGROUND).count()
    }

    #[test]
    fn frame_against_itself_is_empty() {
        let frame = frame_with_square(32, 32, 10, 10, 4);
        let (map, stats) = threshold_difference(&frame, &frame, &full_mask(32, 32)).unwrap();
        assert_eq!(foreground_count(&map), 0);
        assert_eq!(stats.threshold, MIN_THRESHOLD);
    }

    #[test]
    fn lone_pixel_is_removed() {
        let mut map = GrayImage::new(5, 5);
        map.put_pixel(2, 2, Luma([FOREGROUND]));
        assert_eq!(foreground_count(&remove_lone_pixels(&map)), 0);
    }

    #[test]
    fn two_by_two_block_is_preserved() {
        let mut map = GrayImage::new(6, 6);
        for (x, y) in [(2, 2), (3, 2), (2, 3), (3, 3)] {
            map.put_pixel(x, y, Luma([FOREGROUND]));
        }
        assert_eq!(remove_lone_pixels(&map), map);
    }

    #[test]
    fn lone_pixel_on_border_is_removed() {
        let mut map = GrayImage::new(4, 4);
        map.put_pixel(0, 0, Luma([FOREGROUND]));
        assert_eq!(foreground_count(&remove_lone_pixels(&map)), 0);
    }

    #[test]
    fn masked_pixels_never_register() {
        let previous = frame_with_square(32, 32, 0, 0, 0);
        let current = frame_with_square(32, 32, 10, 10, 4);
        let mut mask = full_mask(32, 32);
        for y in 8..16 {
            for x in 8..16 {
                mask.put_pixel(x, y, Luma([MASK_EXCLUDED]));
            }
        }
        let (map, _) = threshold_difference(&current, &previous, &mask).unwrap();
        assert_eq!(foreground_count(&map), 0);
    }

    #[test]
    fn square_appearing_is_detected() {
        let previous = frame_with_square(32, 32, 0, 0, 0);
        let current = frame_with_square(32, 32, 10, 10, 4);
        let (map, stats) = threshold_difference(&current, &previous, &full_mask(32, 32)).unwrap();
        assert_eq!(foreground_count(&map), 16);
        assert!(stats.threshold > MIN_THRESHOLD);
    }

    fn gray16_with_square(width: u32, height: u32, x0: u32, y0: u32, size: u32) -> PixelBuffer {
        let image = ImageBuffer::from_fn(width, height, |x, y| {
            let inside = x >= x0 && x < x0 + size && y >= y0 && y < y0 + size;
            Luma([if inside { 3000u16 } else { 100 }])
        });
        PixelBuffer::Gray16 { image, bit_depth: 12 }
    }

    #[test]
    fn identical_16_bit_frames_give_an_empty_map() {
        let frame = gray16_with_square(32, 32, 10, 10, 4);
        let difference = masked_difference(&frame, &frame, &full_mask(32, 32)).unwrap();
        assert!(difference.pixels().all(|p| p.0[0] == 0));

        let (map, stats) = threshold_difference(&frame, &frame, &full_mask(32, 32)).unwrap();
        assert_eq!(foreground_count(&map), 0);
        assert_eq!(stats.threshold, MIN_THRESHOLD);
    }

    #[test]
    fn square_appearing_in_16_bit_frames_is_detected() {
        let previous = gray16_with_square(32, 32, 0, 0, 0);
        let current = gray16_with_square(32, 32, 10, 10, 4);
        let (map, stats) = threshold_difference(&current, &previous, &full_mask(32, 32)).unwrap();
        assert_eq!(foreground_count(&map), 16);
        assert_eq!(map.get_pixel(11, 11).0[0], FOREGROUND);
        assert!(stats.threshold > MIN_THRESHOLD);
    }

    #[test]
    fn twelve_bit_differences_are_stretched_between_extremes() {
        let previous = PixelBuffer::Gray16 {
            image: ImageBuffer::from_raw(4, 1, vec![500u16, 500, 500, 500]).unwrap(),
            bit_depth: 12,
        };
        let current = PixelBuffer::Gray16 {
            image: ImageBuffer::from_raw(4, 1, vec![600u16, 1100, 4095, 500]).unwrap(),
            bit_depth: 12,
        };
        let mut mask = full_mask(4, 1);
        // Excluded pixels count as a zero difference.
        mask.put_pixel(2, 0, Luma([MASK_EXCLUDED]));
        let difference = masked_difference(&current, &previous, &mask).unwrap();
        // Differences 100, 600, 0, 0 map onto 0..=255 over the 0..600 span.
        assert_eq!(difference.as_raw(), &vec![42, 255, 0, 0]);
    }

    #[test]
    fn mask_size_mismatch_is_rejected() {
        let mut differencer = FrameDifferencer::new();
        let frame = frame_with_square(16, 16, 0, 0, 0);
        let result = differencer.process(&frame, &full_mask(8, 8));
        assert!(matches!(result, Err(DetectionError::GeometryMismatch { .. })));
    }

    #[test]
    fn motion_requires_two_consecutive_threshold_maps() {
        let mut differencer = FrameDifferencer::new();
        let mask = full_mask(40, 40);
        let empty = frame_with_square(40, 40, 0, 0, 0);
        assert!(differencer.process(&empty, &mask).unwrap().is_none());

        // Square appears: threshold map has it, but there is no previous map yet.
        let first = differencer
            .process(&frame_with_square(40, 40, 10, 10, 4), &mask)
            .unwrap()
            .unwrap();
        assert_eq!(foreground_count(&first.threshold_map), 16);
        assert_eq!(foreground_count(&first.motion_map), 0);

        // Square moves: the old position shows up in both maps.
        let second = differencer
            .process(&frame_with_square(40, 40, 20, 20, 4), &mask)
            .unwrap()
            .unwrap();
        assert_eq!(foreground_count(&second.threshold_map), 32);
        assert_eq!(foreground_count(&second.motion_map), 16);
        assert_eq!(second.motion_map.get_pixel(11, 11).0[0], FOREGROUND);
    }
}
