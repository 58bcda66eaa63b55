// THEORY:
// The `RegionGrid` slices the working image into an n x n grid of sub-regions and
// fixes the order in which the local event extractor visits them.
//
// Key architectural principles:
// 1.  **Bounded Work**: The extractor only scans regions that contain motion, so
//     the grid bounds the per-frame scan cost on quiet nights.
// 2.  **Stable Identity**: Regions are enumerated in a square spiral that starts
//     next to the centre of the frame and winds outward (up, right, down, left,
//     the leg length growing every two turns). The order carries no meaning of its
//     own; it only has to be deterministic for a given frame size so region
//     indices are stable from one frame to the next.
// 3.  **Exact Tiling**: The last column and row absorb the integer-division
//     remainder, so every pixel belongs to exactly one region.
// 4.  **Recompute On Resize**: The grid is a pure function of (n, height, width)
//     and is rebuilt only when the working dimensions change.

use crate::error::DetectionError;

/// A rectangular sub-region of the working image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    /// Position of this region in the spiral order.
    pub index: usize,
    /// Grid column and row.
    pub cell: (u32, u32),
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

/// Grid cells in square-spiral order, starting near the centre.
pub fn spiral_cells(n: u32) -> Result<Vec<(u32, u32)>, DetectionError> {
    if n == 0 || n % 2 != 0 {
        return Err(DetectionError::InvalidRegionCount(n));
    }
    let total = (n * n) as usize;
    let mut cells = Vec::with_capacity(total);

    // Up, right, down, left.
    const DIRECTIONS: [(i64, i64); 4] = [(0, -1), (1, 0), (0, 1), (-1, 0)];
    let mut x = (n / 2) as i64 - 1;
    let mut y = (n / 2) as i64;
    let in_grid = |x: i64, y: i64| x >= 0 && y >= 0 && x < n as i64 && y < n as i64;

    cells.push((x as u32, y as u32));
    let mut leg = 1i64;
    let mut turn = 0usize;
    // Every cell lies within n + 1 rings of the start, so the walk is bounded.
    while cells.len() < total && leg <= 2 * n as i64 + 2 {
        let (dx, dy) = DIRECTIONS[turn % 4];
        for _ in 0..leg {
            x += dx;
            y += dy;
            if in_grid(x, y) {
                cells.push((x as u32, y as u32));
            }
        }
        turn += 1;
        if turn % 2 == 0 {
            leg += 1;
        }
    }
    Ok(cells)
}

/// Partitions a `width` x `height` image into `n * n` regions in spiral order.
pub fn spiral_regions(n: u32, height: u32, width: u32) -> Result<Vec<Region>, DetectionError> {
    let cell_width = width / n.max(1);
    let cell_height = height / n.max(1);
    let cells = spiral_cells(n)?;
    Ok(cells
        .into_iter()
        .enumerate()
        .map(|(index, (cx, cy))| {
            let x = cx * cell_width;
            let y = cy * cell_height;
            let region_width = if cx == n - 1 { width - x } else { cell_width };
            let region_height = if cy == n - 1 { height - y } else { cell_height };
            Region {
                index,
                cell: (cx, cy),
                x,
                y,
                width: region_width,
                height: region_height,
            }
        })
        .collect())
}

/// Caches the spiral partition for the current working dimensions.
pub struct RegionGrid {
    subdivisions: u32,
    dimensions: Option<(u32, u32)>,
    regions: Vec<Region>,
}

impl RegionGrid {
    pub fn new(subdivisions: u32) -> Result<Self, DetectionError> {
        spiral_cells(subdivisions)?;
        Ok(Self {
            subdivisions,
            dimensions: None,
            regions: Vec::new(),
        })
    }

    /// Regions for a `width` x `height` image, recomputed only on a size change.
    pub fn regions_for(&mut self, width: u32, height: u32) -> Result<&[Region], DetectionError> {
        if self.dimensions != Some((width, height)) {
            self.regions = spiral_regions(self.subdivisions, height, width)?;
            self.dimensions = Some((width, height));
        }
        Ok(&self.regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn spiral_visits_every_cell_once() {
        for n in [2, 4, 6, 8, 10, 16] {
            let cells = spiral_cells(n).unwrap();
            assert_eq!(cells.len(), (n * n) as usize);
            let unique: HashSet<_> = cells.iter().collect();
            assert_eq!(unique.len(), (n * n) as usize);
        }
    }

    #[test]
    fn spiral_starts_near_centre_and_goes_up() {
        let cells = spiral_cells(4).unwrap();
        assert_eq!(cells[0], (1, 2));
        assert_eq!(cells[1], (1, 1));
        assert_eq!(cells[2], (2, 1));
    }

    #[test]
    fn odd_or_zero_subdivisions_are_rejected() {
        assert!(matches!(spiral_cells(3), Err(DetectionError::InvalidRegionCount(3))));
        assert!(matches!(spiral_cells(0), Err(DetectionError::InvalidRegionCount(0))));
    }

    #[test]
    fn regions_tile_the_frame_without_gaps_or_overlaps() {
        let (width, height) = (103, 77);
        let regions = spiral_regions(4, height, width).unwrap();
        let mut owners = vec![0u8; (width * height) as usize];
        for region in &regions {
            for y in region.y..region.y + region.height {
                for x in region.x..region.x + region.width {
                    owners[(y * width + x) as usize] += 1;
                }
            }
        }
        assert!(owners.iter().all(|&count| count == 1));
        assert!(regions.iter().any(|r| r.contains(width - 1, height - 1)));
    }

    #[test]
    fn grid_is_stable_across_frames_of_same_size() {
        let mut grid = RegionGrid::new(6).unwrap();
        let first = grid.regions_for(120, 90).unwrap().to_vec();
        let second = grid.regions_for(120, 90).unwrap().to_vec();
        assert_eq!(first, second);
    }
}
