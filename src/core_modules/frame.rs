// THEORY:
// The `Frame` module is the most fundamental unit of the detection engine. It is a
// "dumb" data container for one grayscale exposure delivered by the camera, plus
// the few single-image transforms every later stage needs.
//
// Key architectural principles:
// 1.  **Depth Agnostic**: Astronomical cameras deliver 8-bit or 16-bit samples
//     (often 12 significant bits packed in 16). `PixelBuffer` keeps the native
//     depth so saturation tests and histograms stay exact; anything that needs a
//     common scale asks for `to_gray8`.
// 2.  **Immutability**: A `Frame` is never mutated once produced. Ownership moves
//     frame by frame into the pipeline, which only ever keeps the previous working
//     image around.
// 3.  **Spatial Pooling**: `downsample` averages 2x2 blocks. On large sensors this
//     quarters the per-frame cost of every later stage and doubles as a cheap
//     noise reduction, in the same spirit as averaging a chunk of pixels.

pub mod frame {
    use image::{GrayImage, ImageBuffer, Luma, Primitive};

    pub type Gray16Image = ImageBuffer<Luma<u16>, Vec<u16>>;

    /// Camera settings in effect when a frame was exposed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CameraSettings {
        pub gain: i32,
        pub exposure_us: u32,
    }

    /// A single-channel pixel buffer at its native depth.
    #[derive(Debug, Clone, PartialEq)]
    pub enum PixelBuffer {
        Gray8(GrayImage),
        /// 16-bit storage carrying `bit_depth` significant bits (9..=16).
        Gray16 { image: Gray16Image, bit_depth: u8 },
    }

    impl PixelBuffer {
        pub fn width(&self) -> u32 {
            match self {
                PixelBuffer::Gray8(image) => image.width(),
                PixelBuffer::Gray16 { image, .. } => image.width(),
            }
        }

        pub fn height(&self) -> u32 {
            match self {
                PixelBuffer::Gray8(image) => image.height(),
                PixelBuffer::Gray16 { image, .. } => image.height(),
            }
        }

        pub fn dimensions(&self) -> (u32, u32) {
            (self.width(), self.height())
        }

        pub fn bit_depth(&self) -> u8 {
            match self {
                PixelBuffer::Gray8(_) => 8,
                PixelBuffer::Gray16 { bit_depth, .. } => *bit_depth,
            }
        }

        /// The largest value the sensor can report at this depth.
        pub fn saturation(&self) -> u16 {
            ((1u32 << self.bit_depth().clamp(1, 16)) - 1) as u16
        }

        /// Row-major samples widened to u16.
        pub fn samples(&self) -> Box<dyn Iterator<Item = u16> + '_> {
            match self {
                PixelBuffer::Gray8(image) => Box::new(image.as_raw().iter().map(|&v| v as u16)),
                PixelBuffer::Gray16 { image, .. } => Box::new(image.as_raw().iter().copied()),
            }
        }

        pub fn value(&self, x: u32, y: u32) -> u16 {
            match self {
                PixelBuffer::Gray8(image) => image.get_pixel(x, y).0[0] as u16,
                PixelBuffer::Gray16 { image, .. } => image.get_pixel(x, y).0[0],
            }
        }

        /// Rescales the buffer to the 0..=255 range using its bit depth.
        pub fn to_gray8(&self) -> GrayImage {
            match self {
                PixelBuffer::Gray8(image) => image.clone(),
                PixelBuffer::Gray16 { image, .. } => {
                    let saturation = self.saturation() as u32;
                    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
                        let v = image.get_pixel(x, y).0[0] as u32;
                        Luma([((v.min(saturation) * 255) / saturation) as u8])
                    })
                }
            }
        }

        /// Halves both dimensions by averaging 2x2 blocks.
        pub fn downsample(&self) -> PixelBuffer {
            match self {
                PixelBuffer::Gray8(image) => {
                    PixelBuffer::Gray8(halve(image, |v| v as u32, |v| v as u8))
                }
                PixelBuffer::Gray16 { image, bit_depth } => PixelBuffer::Gray16 {
                    image: halve(image, |v| v as u32, |v| v as u16),
                    bit_depth: *bit_depth,
                },
            }
        }
    }

    fn halve<P: Primitive>(
        source: &ImageBuffer<Luma<P>, Vec<P>>,
        widen: fn(P) -> u32,
        narrow: fn(u32) -> P,
    ) -> ImageBuffer<Luma<P>, Vec<P>> {
        let width = (source.width() / 2).max(1);
        let height = (source.height() / 2).max(1);
        ImageBuffer::from_fn(width, height, |x, y| {
            let mut sum = 0u32;
            let mut count = 0u32;
            for dy in 0..2 {
                for dx in 0..2 {
                    let sx = x * 2 + dx;
                    let sy = y * 2 + dy;
                    if sx < source.width() && sy < source.height() {
                        sum += widen(source.get_pixel(sx, sy).0[0]);
                        count += 1;
                    }
                }
            }
            Luma([narrow(sum / count.max(1))])
        })
    }

    /// One exposure delivered by the frame source.
    #[derive(Debug, Clone)]
    pub struct Frame {
        /// Monotonically increasing acquisition index.
        pub index: u64,
        /// Acquisition time in microseconds since the Unix epoch.
        pub timestamp_us: u64,
        pub settings: CameraSettings,
        pub buffer: PixelBuffer,
    }

    impl Frame {
        pub fn new(index: u64, timestamp_us: u64, settings: CameraSettings, buffer: PixelBuffer) -> Self {
            Self {
                index,
                timestamp_us,
                settings,
                buffer,
            }
        }

        pub fn from_gray8(index: u64, timestamp_us: u64, image: GrayImage) -> Self {
            Self::new(index, timestamp_us, CameraSettings::default(), PixelBuffer::Gray8(image))
        }

        pub fn width(&self) -> u32 {
            self.buffer.width()
        }

        pub fn height(&self) -> u32 {
            self.buffer.height()
        }
    }
}
