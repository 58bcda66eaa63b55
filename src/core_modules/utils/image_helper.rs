pub mod image_helper {
    use crate::core_modules::local_event::PALETTE;
    use crate::error::StorageError;
    use image::codecs::png::PngEncoder;
    use image::{ExtendedColorType, GrayImage, ImageEncoder, Rgb, RgbImage};
    use std::io::BufWriter;
    use std::path::Path;

    pub fn save_png(
        path: &Path,
        width: u32,
        height: u32,
        buffer: &[u8],
        color: ExtendedColorType,
    ) -> Result<(), StorageError> {
        let output = std::fs::File::create(path).map_err(|e| StorageError::io(path, e))?;
        let encoder = PngEncoder::new(BufWriter::new(output));

        encoder.write_image(buffer, width, height, color)?;

        Ok(())
    }

    pub fn save_gray(path: &Path, image: &GrayImage) -> Result<(), StorageError> {
        save_png(path, image.width(), image.height(), image.as_raw(), ExtendedColorType::L8)
    }

    pub fn save_rgb(path: &Path, image: &RgbImage) -> Result<(), StorageError> {
        save_png(path, image.width(), image.height(), image.as_raw(), ExtendedColorType::Rgb8)
    }

    /// Renders an event map (palette ids, 0 = empty) in the palette colours.
    pub fn colorize_event_map(event_map: &GrayImage) -> RgbImage {
        RgbImage::from_fn(event_map.width(), event_map.height(), |x, y| {
            match event_map.get_pixel(x, y).0[0] {
                0 => Rgb([0, 0, 0]),
                id => Rgb(PALETTE[(id as usize - 1) % PALETTE.len()]),
            }
        })
    }

    /// Paints `mask` pixels over a grayscale background in `color`.
    pub fn overlay(background: &GrayImage, mask: &GrayImage, color: [u8; 3]) -> RgbImage {
        RgbImage::from_fn(background.width(), background.height(), |x, y| {
            let owned = mask.get_pixel_checked(x, y).is_some_and(|p| p.0[0] != 0);
            if owned {
                Rgb(color)
            } else {
                let v = background.get_pixel(x, y).0[0];
                Rgb([v, v, v])
            }
        })
    }
}
