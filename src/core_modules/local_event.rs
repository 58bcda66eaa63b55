// THEORY:
// The `LocalEvent` module is the primary data container of the spatial grouping
// layer. A `LocalEvent` is one spatially coherent patch of motion inside a single
// frame. It knows nothing about earlier frames; linking patches over time is the
// job of the global event tracker.
//
// Key architectural principles:
// 1.  **ROI Ownership**: A local event grows by absorbing fixed-size square ROIs
//     centred on motion pixels. Its ownership map is the union of those squares.
//     Only the ROI centres are stored; the union is rasterised on demand into a
//     small flat buffer covering the bounding box, so no per-pixel heap objects
//     and no full-frame copy per event.
// 2.  **Mass Centre**: The centroid is the mean coordinate of every pixel in the
//     union, recomputed each time the event grows.
// 3.  **Capability Colours**: Each live local event owns a `ColorTag` minted by a
//     `Palette`. The tag is only an ownership key in the per-frame event map; the
//     palette belongs to the detection session, never to global state.
// 4.  **Area Cap**: Growth that would push the union above a configured area is
//     refused, bounding how much of the frame one event can swallow.

use image::{GrayImage, Luma};

/// A pixel coordinate in the working image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// An axis aligned rectangle; `width` and `height` are in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Rect {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }
}

/// Display colours handed out to local and global events.
pub const PALETTE: [[u8; 3]; 20] = [
    [255, 0, 0],
    [0, 255, 0],
    [0, 0, 255],
    [255, 255, 0],
    [0, 255, 255],
    [255, 0, 255],
    [255, 128, 0],
    [128, 0, 255],
    [0, 255, 128],
    [255, 0, 128],
    [128, 255, 0],
    [0, 128, 255],
    [255, 128, 128],
    [128, 255, 128],
    [128, 128, 255],
    [192, 192, 0],
    [0, 192, 192],
    [192, 0, 192],
    [255, 255, 255],
    [160, 82, 45],
];

/// A palette slot owned by one live event. Only a `Palette` can mint one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorTag(u8);

impl ColorTag {
    /// The value painted into the event map (1..=20, 0 means "no owner").
    pub fn id(self) -> u8 {
        self.0
    }

    pub fn rgb(self) -> [u8; 3] {
        PALETTE[(self.0 - 1) as usize]
    }
}

/// Allocates colour tags for the local events of one frame.
#[derive(Debug, Clone, Default)]
pub struct Palette {
    in_use: [bool; PALETTE.len()],
}

impl Palette {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Option<ColorTag> {
        let slot = self.in_use.iter().position(|used| !used)?;
        self.in_use[slot] = true;
        Some(ColorTag(slot as u8 + 1))
    }

    pub fn release(&mut self, tag: ColorTag) {
        self.in_use[(tag.0 - 1) as usize] = false;
    }

    pub fn release_all(&mut self) {
        self.in_use = [false; PALETTE.len()];
    }

    pub fn available(&self) -> usize {
        self.in_use.iter().filter(|used| !**used).count()
    }

    /// Resolves an event-map value back to the tag it was painted with.
    pub fn lookup(&self, id: u8) -> Option<ColorTag> {
        let slot = (id as usize).checked_sub(1)?;
        match self.in_use.get(slot) {
            Some(true) => Some(ColorTag(id)),
            _ => None,
        }
    }
}

/// Rasterised summary of a set of ROI squares.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Footprint {
    bounds: Rect,
    area: usize,
    mass_center: (f64, f64),
}

fn roi_rect(center: Point, roi_size: u32) -> Rect {
    Rect {
        x: center.x.saturating_sub(roi_size / 2),
        y: center.y.saturating_sub(roi_size / 2),
        width: roi_size,
        height: roi_size,
    }
}

fn footprint(centers: &[Point], roi_size: u32) -> Footprint {
    let Some(first) = centers.first() else {
        return Footprint {
            bounds: Rect::default(),
            area: 0,
            mass_center: (0.0, 0.0),
        };
    };
    let bounds = centers
        .iter()
        .skip(1)
        .fold(roi_rect(*first, roi_size), |acc, c| acc.union(&roi_rect(*c, roi_size)));

    let mut cells = vec![false; (bounds.width * bounds.height) as usize];
    for center in centers {
        let rect = roi_rect(*center, roi_size);
        for y in rect.y..rect.bottom() {
            let row = ((y - bounds.y) * bounds.width) as usize;
            for x in rect.x..rect.right() {
                cells[row + (x - bounds.x) as usize] = true;
            }
        }
    }

    let mut area = 0usize;
    let (mut sum_x, mut sum_y) = (0f64, 0f64);
    for (i, _) in cells.iter().enumerate().filter(|(_, owned)| **owned) {
        area += 1;
        sum_x += (bounds.x + i as u32 % bounds.width) as f64;
        sum_y += (bounds.y + i as u32 / bounds.width) as f64;
    }
    Footprint {
        bounds,
        area,
        mass_center: (sum_x / area as f64, sum_y / area as f64),
    }
}

/// One patch of motion found in a single frame.
#[derive(Debug, Clone)]
pub struct LocalEvent {
    color: ColorTag,
    frame_index: u64,
    roi_size: u32,
    /// Every ROI centre absorbed so far, in absorption order.
    roi_centers: Vec<Point>,
    footprint: Footprint,
}

impl LocalEvent {
    pub fn new(color: ColorTag, anchor: Point, frame_index: u64, roi_size: u32) -> Self {
        let roi_centers = vec![anchor];
        let footprint = footprint(&roi_centers, roi_size);
        Self {
            color,
            frame_index,
            roi_size,
            roi_centers,
            footprint,
        }
    }

    pub fn color(&self) -> ColorTag {
        self.color
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn roi_size(&self) -> u32 {
        self.roi_size
    }

    pub fn roi_centers(&self) -> &[Point] {
        &self.roi_centers
    }

    pub fn area(&self) -> usize {
        self.footprint.area
    }

    pub fn bounds(&self) -> Rect {
        self.footprint.bounds
    }

    /// Mean position of every pixel owned by this event.
    pub fn mass_center(&self) -> (f64, f64) {
        self.footprint.mass_center
    }

    pub fn roi_rects(&self) -> impl Iterator<Item = Rect> + '_ {
        self.roi_centers.iter().map(|c| roi_rect(*c, self.roi_size))
    }

    /// Adds the ROI centred on `center` unless the union would exceed `max_area`.
    pub fn try_add_roi(&mut self, center: Point, max_area: usize) -> bool {
        self.roi_centers.push(center);
        let grown = footprint(&self.roi_centers, self.roi_size);
        if grown.area > max_area {
            self.roi_centers.pop();
            return false;
        }
        self.footprint = grown;
        true
    }

    /// Absorbs every ROI of `other` unless the union would exceed `max_area`.
    pub fn try_absorb(&mut self, other: &LocalEvent, max_area: usize) -> bool {
        let original_len = self.roi_centers.len();
        self.roi_centers.extend_from_slice(&other.roi_centers);
        let grown = footprint(&self.roi_centers, self.roi_size);
        if grown.area > max_area {
            self.roi_centers.truncate(original_len);
            return false;
        }
        self.footprint = grown;
        true
    }

    /// True if any owned pixel is set in `map`.
    pub fn overlaps(&self, map: &GrayImage) -> bool {
        self.roi_rects().any(|rect| {
            (rect.y..rect.bottom().min(map.height()))
                .any(|y| (rect.x..rect.right().min(map.width())).any(|x| map.get_pixel(x, y).0[0] != 0))
        })
    }

    /// Writes `value` over every owned pixel of `map`, clipped to its bounds.
    pub fn paint(&self, map: &mut GrayImage, value: u8) {
        for rect in self.roi_rects() {
            for y in rect.y..rect.bottom().min(map.height()) {
                for x in rect.x..rect.right().min(map.width()) {
                    map.put_pixel(x, y, Luma([value]));
                }
            }
        }
    }

    /// Full-frame binary ownership map.
    pub fn ownership_map(&self, width: u32, height: u32) -> GrayImage {
        let mut map = GrayImage::new(width, height);
        self.paint(&mut map, 255);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn palette_hands_out_unique_tags_until_exhausted() {
        let mut palette = Palette::new();
        let tags: Vec<_> = std::iter::from_fn(|| palette.allocate()).collect();
        assert_eq!(tags.len(), PALETTE.len());
        assert!(palette.allocate().is_none());
        palette.release(tags[3]);
        assert_eq!(palette.allocate(), Some(tags[3]));
    }

    #[test]
    fn lookup_only_resolves_live_tags() {
        let mut palette = Palette::new();
        let tag = palette.allocate().unwrap();
        assert_eq!(palette.lookup(tag.id()), Some(tag));
        assert_eq!(palette.lookup(0), None);
        palette.release_all();
        assert_eq!(palette.lookup(tag.id()), None);
    }

    #[test]
    fn single_roi_centroid_and_area() {
        let mut palette = Palette::new();
        let event = LocalEvent::new(palette.allocate().unwrap(), Point::new(20, 30), 7, 10);
        assert_eq!(event.area(), 100);
        assert_eq!(event.frame_index(), 7);
        let (cx, cy) = event.mass_center();
        assert_relative_eq!(cx, 19.5);
        assert_relative_eq!(cy, 29.5);
    }

    #[test]
    fn overlapping_rois_count_pixels_once() {
        let mut palette = Palette::new();
        let mut event = LocalEvent::new(palette.allocate().unwrap(), Point::new(20, 20), 0, 10);
        assert!(event.try_add_roi(Point::new(25, 20), 1000));
        assert_eq!(event.area(), 150);
        let (cx, _) = event.mass_center();
        assert_relative_eq!(cx, 22.0);
    }

    #[test]
    fn area_cap_refuses_growth() {
        let mut palette = Palette::new();
        let mut event = LocalEvent::new(palette.allocate().unwrap(), Point::new(20, 20), 0, 10);
        assert!(!event.try_add_roi(Point::new(40, 20), 150));
        assert_eq!(event.roi_centers().len(), 1);
        assert_eq!(event.area(), 100);
    }

    #[test]
    fn overlap_with_map() {
        let mut palette = Palette::new();
        let event = LocalEvent::new(palette.allocate().unwrap(), Point::new(20, 20), 0, 10);
        let mut map = GrayImage::new(64, 64);
        assert!(!event.overlaps(&map));
        map.put_pixel(24, 24, Luma([255]));
        assert!(event.overlaps(&map));
    }
}
