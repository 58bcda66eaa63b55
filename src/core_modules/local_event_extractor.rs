// THEORY:
// The local event extractor is the engine of the spatial grouping layer. It turns
// the motion map of one frame into a short list of `LocalEvent`s.
//
// Key architectural principles & algorithm steps:
// 1.  **Region Skipping**: Regions are visited in spiral order and a region with
//     no foreground at all is skipped outright.
// 2.  **ROI Growth**: Every remaining foreground pixel whose ROI window fits in the
//     frame looks at the event map under that window. The colours it finds decide
//     what happens:
//     - no colour: a new local event is anchored here (subject to the per-frame
//       cap and palette availability);
//     - one colour: the ROI joins the event that owns the colour;
//     - several colours: the oldest touching event takes the ROI and then swallows
//       the younger ones, as long as the area cap allows it.
// 3.  **Consumption**: Once a ROI has been claimed it is erased from the motion
//     map, so the same pixels are never processed twice and the scan stays close
//     to linear in the number of foreground pixels.
// 4.  **Single Frame**: The extractor has no memory. The palette and event map are
//     reset at the start of every frame.

use crate::core_modules::local_event::{LocalEvent, Palette, Point};
use crate::core_modules::region_grid::Region;
use image::{GrayImage, Luma};
use tracing::Span;

/// Limits applied while growing local events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionParams {
    /// Side of the square ROI patch, in pixels.
    pub roi_size: u32,
    /// Maximum number of local events per frame.
    pub max_local_events: usize,
    /// Maximum number of pixels one local event may own.
    pub max_local_event_area: usize,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self {
            roi_size: 10,
            max_local_events: 10,
            max_local_event_area: 2000,
        }
    }
}

/// The local events of one frame and the colour map they were painted into.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub local_events: Vec<LocalEvent>,
    /// Palette ids (1..=20) of the owning local event, 0 where nothing was claimed.
    pub event_map: GrayImage,
}

pub mod local_event_extractor {
    use super::*;
    use tracing::{debug, trace};

    /// Runs extraction over every region of the frame.
    pub fn extract_frame(
        regions: &[Region],
        motion_map: &mut GrayImage,
        palette: &mut Palette,
        frame_index: u64,
        params: &ExtractionParams,
        span: &Span,
    ) -> Extraction {
        palette.release_all();
        let mut event_map = GrayImage::new(motion_map.width(), motion_map.height());
        let mut local_events = Vec::new();

        for region in regions {
            if !region_has_motion(region, motion_map) {
                continue;
            }
            extract(
                region,
                motion_map,
                &mut event_map,
                &mut local_events,
                palette,
                frame_index,
                params,
                span,
            );
        }

        span.in_scope(|| trace!(frame_index, count = local_events.len(), "local events extracted"));
        Extraction {
            local_events,
            event_map,
        }
    }

    pub fn region_has_motion(region: &Region, motion_map: &GrayImage) -> bool {
        (region.y..region.y + region.height)
            .any(|y| (region.x..region.x + region.width).any(|x| motion_map.get_pixel(x, y).0[0] != 0))
    }

    /// Grows local events from the foreground pixels of one region.
    #[allow(clippy::too_many_arguments)]
    pub fn extract(
        region: &Region,
        motion_map: &mut GrayImage,
        event_map: &mut GrayImage,
        local_events: &mut Vec<LocalEvent>,
        palette: &mut Palette,
        frame_index: u64,
        params: &ExtractionParams,
        span: &Span,
    ) {
        let (width, height) = motion_map.dimensions();
        let half = params.roi_size / 2;

        for y in region.y..region.y + region.height {
            for x in region.x..region.x + region.width {
                if motion_map.get_pixel(x, y).0[0] == 0 {
                    continue;
                }
                // The whole ROI window has to lie inside the frame.
                if x < half || y < half || x - half + params.roi_size > width || y - half + params.roi_size > height {
                    continue;
                }
                let center = Point::new(x, y);
                let window = RoiWindow {
                    x: x - half,
                    y: y - half,
                    size: params.roi_size,
                };

                // --- 1. Which events already own part of this window? ---
                let mut owners: Vec<usize> = window
                    .colors(event_map)
                    .into_iter()
                    .filter_map(|id| local_events.iter().position(|le| le.color().id() == id))
                    .collect();
                // Creation order doubles as age order.
                owners.sort_unstable();

                // --- 2. Grow, create or merge ---
                let claimed = match owners.as_slice() {
                    [] => create(center, local_events, palette, frame_index, params, event_map),
                    [owner] => grow(*owner, center, local_events, params, event_map),
                    [oldest, younger @ ..] => {
                        merge(*oldest, younger, center, local_events, palette, params, event_map, span)
                    }
                };

                // --- 3. Consume the ROI ---
                if claimed {
                    window.fill(motion_map, 0);
                }
            }
        }
    }

    fn create(
        center: Point,
        local_events: &mut Vec<LocalEvent>,
        palette: &mut Palette,
        frame_index: u64,
        params: &ExtractionParams,
        event_map: &mut GrayImage,
    ) -> bool {
        if local_events.len() >= params.max_local_events {
            return false;
        }
        let Some(color) = palette.allocate() else {
            return false;
        };
        let event = LocalEvent::new(color, center, frame_index, params.roi_size);
        event.paint(event_map, color.id());
        local_events.push(event);
        true
    }

    fn grow(
        owner: usize,
        center: Point,
        local_events: &mut [LocalEvent],
        params: &ExtractionParams,
        event_map: &mut GrayImage,
    ) -> bool {
        let event = &mut local_events[owner];
        if !event.try_add_roi(center, params.max_local_event_area) {
            return false;
        }
        event.paint(event_map, event.color().id());
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn merge(
        oldest: usize,
        younger: &[usize],
        center: Point,
        local_events: &mut Vec<LocalEvent>,
        palette: &mut Palette,
        params: &ExtractionParams,
        event_map: &mut GrayImage,
        span: &Span,
    ) -> bool {
        if !local_events[oldest].try_add_roi(center, params.max_local_event_area) {
            span.in_scope(|| debug!(x = center.x, y = center.y, "roi left unassigned, merge target at area cap"));
            return false;
        }

        let mut absorbed = Vec::with_capacity(younger.len());
        for &index in younger {
            // `oldest` always sorts before every younger index.
            let (head, tail) = local_events.split_at_mut(index);
            if head[oldest].try_absorb(&tail[0], params.max_local_event_area) {
                absorbed.push(index);
            } else {
                span.in_scope(|| {
                    debug!(
                        kept = tail[0].color().id(),
                        into = head[oldest].color().id(),
                        "touching local event not merged, area cap reached"
                    )
                });
            }
        }

        for &index in absorbed.iter().rev() {
            let gone = local_events.remove(index);
            palette.release(gone.color());
        }

        // Every removed index is larger than `oldest`, so it still names the survivor.
        let survivor = &local_events[oldest];
        survivor.paint(event_map, survivor.color().id());
        true
    }

    /// The square window around a candidate pixel.
    struct RoiWindow {
        x: u32,
        y: u32,
        size: u32,
    }

    impl RoiWindow {
        /// Distinct non-zero event-map values under the window.
        fn colors(&self, event_map: &GrayImage) -> Vec<u8> {
            let mut seen = [false; 256];
            for y in self.y..self.y + self.size {
                for x in self.x..self.x + self.size {
                    seen[event_map.get_pixel(x, y).0[0] as usize] = true;
                }
            }
            (1..=255u8).filter(|&id| seen[id as usize]).collect()
        }

        fn fill(&self, map: &mut GrayImage, value: u8) {
            for y in self.y..self.y + self.size {
                for x in self.x..self.x + self.size {
                    map.put_pixel(x, y, Luma([value]));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::local_event_extractor::*;
    use super::*;
    use crate::core_modules::region_grid::spiral_regions;

    fn motion_with_blocks(width: u32, height: u32, blocks: &[(u32, u32, u32)]) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let inside = blocks
                .iter()
                .any(|&(bx, by, size)| x >= bx && x < bx + size && y >= by && y < by + size);
            Luma([if inside { 255 } else { 0 }])
        })
    }

    fn run(motion: &mut GrayImage, params: &ExtractionParams) -> Extraction {
        let regions = spiral_regions(2, motion.height(), motion.width()).unwrap();
        let mut palette = Palette::new();
        extract_frame(&regions, motion, &mut palette, 3, params, &Span::none())
    }

    #[test]
    fn one_blob_yields_one_local_event() {
        let mut motion = motion_with_blocks(64, 64, &[(20, 20, 4)]);
        let extraction = run(&mut motion, &ExtractionParams::default());
        assert_eq!(extraction.local_events.len(), 1);
        let event = &extraction.local_events[0];
        assert_eq!(event.frame_index(), 3);
        assert_eq!(event.roi_centers()[0], Point::new(20, 20));
        // The claimed ROI is consumed from the motion map.
        assert!(motion.pixels().all(|p| p.0[0] == 0));
        assert_eq!(extraction.event_map.get_pixel(20, 20).0[0], event.color().id());
    }

    #[test]
    fn distant_blobs_yield_separate_events() {
        let mut motion = motion_with_blocks(64, 64, &[(12, 12, 3), (45, 45, 3)]);
        let extraction = run(&mut motion, &ExtractionParams::default());
        assert_eq!(extraction.local_events.len(), 2);
        assert_ne!(
            extraction.local_events[0].color(),
            extraction.local_events[1].color()
        );
    }

    #[test]
    fn elongated_blob_grows_a_single_event() {
        // A 2 px tall streak much longer than the ROI.
        let mut motion = GrayImage::from_fn(64, 32, |x, y| Luma([if (10..40).contains(&x) && (15..17).contains(&y) { 255 } else { 0 }]));
        let extraction = run(&mut motion, &ExtractionParams::default());
        assert_eq!(extraction.local_events.len(), 1);
        assert!(extraction.local_events[0].roi_centers().len() > 1);
    }

    #[test]
    fn pixels_near_the_border_are_skipped() {
        let mut motion = motion_with_blocks(32, 32, &[(0, 0, 3)]);
        let extraction = run(&mut motion, &ExtractionParams::default());
        assert!(extraction.local_events.is_empty());
    }

    #[test]
    fn local_event_cap_is_respected() {
        let blocks: Vec<_> = (0..4).map(|i| (10 + i * 20, 10, 2)).collect();
        let mut motion = motion_with_blocks(96, 32, &blocks);
        let params = ExtractionParams {
            max_local_events: 2,
            ..ExtractionParams::default()
        };
        let extraction = run(&mut motion, &params);
        assert_eq!(extraction.local_events.len(), 2);
    }

    #[test]
    fn bridging_pixel_merges_touching_events_into_the_oldest() {
        let params = ExtractionParams::default();
        let mut palette = Palette::new();
        let mut event_map = GrayImage::new(64, 64);
        let mut local_events = Vec::new();
        let region = Region {
            index: 0,
            cell: (0, 0),
            x: 0,
            y: 0,
            width: 64,
            height: 64,
        };

        // Two events 12 px apart, then a pixel whose window touches both.
        let mut motion = motion_with_blocks(64, 64, &[(20, 20, 1), (32, 20, 1)]);
        extract(&region, &mut motion, &mut event_map, &mut local_events, &mut palette, 0, &params, &Span::none());
        assert_eq!(local_events.len(), 2);
        let oldest = local_events[0].color();

        let mut bridge = motion_with_blocks(64, 64, &[(26, 22, 1)]);
        extract(&region, &mut bridge, &mut event_map, &mut local_events, &mut palette, 0, &params, &Span::none());
        assert_eq!(local_events.len(), 1);
        assert_eq!(local_events[0].color(), oldest);
        assert_eq!(local_events[0].roi_centers().len(), 3);
        assert_eq!(palette.available(), 19);
        assert!(event_map.pixels().all(|p| p.0[0] == 0 || p.0[0] == oldest.id()));
    }

    #[test]
    fn merge_respects_area_cap() {
        let params = ExtractionParams {
            max_local_event_area: 200,
            ..ExtractionParams::default()
        };
        let mut palette = Palette::new();
        let mut event_map = GrayImage::new(64, 64);
        let mut local_events = Vec::new();
        let region = Region {
            index: 0,
            cell: (0, 0),
            x: 0,
            y: 0,
            width: 64,
            height: 64,
        };
        let mut motion = motion_with_blocks(64, 64, &[(20, 20, 1), (32, 20, 1)]);
        extract(&region, &mut motion, &mut event_map, &mut local_events, &mut palette, 0, &params, &Span::none());

        let mut bridge = motion_with_blocks(64, 64, &[(26, 22, 1)]);
        extract(&region, &mut bridge, &mut event_map, &mut local_events, &mut palette, 0, &params, &Span::none());
        // The bridge ROI fits into the oldest (168 px) but absorbing the younger
        // one would reach 236 px, so both survive.
        assert_eq!(local_events.len(), 2);
        assert_eq!(local_events[0].roi_centers().len(), 2);
    }
}
