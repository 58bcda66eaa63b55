// THEORY:
// The `histogram` module condenses a whole frame into one brightness statistic, the
// Mean Sample Value (MSV). The intensity range of the sensor is split into five
// equal bins; the MSV is the count-weighted mean of the bin numbers 1..=5. A dark
// frame scores close to 1, a saturated one close to 5, and 2.5 is the balance
// point the exposure controller steers towards.
//
// It is a stateless utility with no knowledge of time or of the camera.

pub mod histogram {
    use crate::core_modules::frame::frame::PixelBuffer;

    pub const MSV_BINS: usize = 5;
    /// Balance point the exposure search converges on.
    pub const MSV_TARGET: f64 = 2.5;

    /// Counts samples into five equal-width intensity bins.
    pub fn five_bin_histogram(buffer: &PixelBuffer) -> [u64; MSV_BINS] {
        let levels = buffer.saturation() as u64 + 1;
        let mut bins = [0u64; MSV_BINS];
        for sample in buffer.samples() {
            let bin = ((sample as u64 * MSV_BINS as u64) / levels) as usize;
            bins[bin.min(MSV_BINS - 1)] += 1;
        }
        bins
    }

    /// Weighted mean of bin numbers 1..=5. An empty histogram scores 0.
    pub fn mean_sample_value(bins: &[u64; MSV_BINS]) -> f64 {
        let total: u64 = bins.iter().sum();
        if total == 0 {
            return 0.0;
        }
        let weighted: u64 = bins
            .iter()
            .enumerate()
            .map(|(i, &count)| (i as u64 + 1) * count)
            .sum();
        weighted as f64 / total as f64
    }

    pub fn frame_msv(buffer: &PixelBuffer) -> f64 {
        mean_sample_value(&five_bin_histogram(buffer))
    }
}
