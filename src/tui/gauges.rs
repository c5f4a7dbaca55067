use rand::Rng;

/// Glyph ramp from lowest to highest intensity.
const BLOCKS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Bounded FIFO of recent speed samples rendered as a sparkline.
///
/// `render` always yields exactly `capacity` glyphs, newest samples on the
/// right, so the analyzer panel never changes width.
pub struct SampleBuffer {
    capacity: usize,
    samples: Vec<f64>,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Vec::with_capacity(capacity),
        }
    }

    /// Oldest-first view of the buffered samples.
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Append one sample, evicting the oldest when full. Negative input
    /// clamps to zero.
    pub fn push(&mut self, value: f64) {
        self.samples.push(value.max(0.0));
        if self.samples.len() > self.capacity {
            let _ = self.samples.drain(0..(self.samples.len() - self.capacity));
        }
    }

    pub fn render(&self) -> String {
        if self.samples.is_empty() {
            // Idle shimmer from the two lowest glyphs.
            let mut rng = rand::thread_rng();
            return (0..self.capacity).map(|_| BLOCKS[rng.gen_range(0..2)]).collect();
        }

        // A max of zero counts as one so an all-zero buffer renders the
        // lowest glyph instead of dividing by zero.
        let max = self.samples.iter().copied().fold(0.0_f64, f64::max);
        let max = if max > 0.0 { max } else { 1.0 };

        let mut out = String::with_capacity(self.capacity * BLOCKS[7].len_utf8());
        for _ in self.samples.len()..self.capacity {
            out.push(BLOCKS[0]);
        }
        for v in &self.samples {
            let idx = ((v / max) * (BLOCKS.len() - 1) as f64) as usize;
            out.push(BLOCKS[idx.min(BLOCKS.len() - 1)]);
        }
        out
    }
}

/// Needle position for the speed gauge: current speed against a fixed
/// ceiling, saturating at both ends.
pub struct Speedometer {
    max_mbps: f64,
}

impl Speedometer {
    pub fn new(max_mbps: f64) -> Self {
        Self {
            max_mbps: max_mbps.max(1.0),
        }
    }

    pub fn max_mbps(&self) -> f64 {
        self.max_mbps
    }

    // Gauge widgets require a ratio inside [0, 1].
    pub fn ratio(&self, mbps: f64) -> f64 {
        if !mbps.is_finite() {
            return 0.0;
        }
        (mbps / self.max_mbps).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glyphs(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn render_is_always_capacity_wide() {
        let mut buffer = SampleBuffer::new(40);
        assert_eq!(glyphs(&buffer.render()).len(), 40);

        buffer.push(10.0);
        buffer.push(20.0);
        assert_eq!(glyphs(&buffer.render()).len(), 40);

        for i in 0..100 {
            buffer.push(i as f64);
        }
        assert_eq!(glyphs(&buffer.render()).len(), 40);
    }

    #[test]
    fn empty_buffer_renders_low_shimmer() {
        let buffer = SampleBuffer::new(50);
        let rendered = glyphs(&buffer.render());
        assert_eq!(rendered.len(), 50);
        assert!(rendered.iter().all(|c| *c == '▁' || *c == '▂'));
    }

    #[test]
    fn all_zero_buffer_renders_lowest_glyph() {
        let mut buffer = SampleBuffer::new(8);
        for _ in 0..8 {
            buffer.push(0.0);
        }
        assert_eq!(buffer.render(), "▁▁▁▁▁▁▁▁");
    }

    #[test]
    fn partial_buffer_left_pads_with_lowest_glyph() {
        let mut buffer = SampleBuffer::new(5);
        buffer.push(4.0);
        assert_eq!(buffer.render(), "▁▁▁▁█");
    }

    #[test]
    fn samples_normalize_against_current_max() {
        let mut buffer = SampleBuffer::new(3);
        buffer.push(0.0);
        buffer.push(50.0);
        buffer.push(100.0);
        // 0 -> lowest, half of max -> floor(3.5) -> fourth glyph, max -> top.
        assert_eq!(buffer.render(), "▁▄█");
    }

    #[test]
    fn push_evicts_oldest_first() {
        let mut buffer = SampleBuffer::new(3);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            buffer.push(v);
        }
        assert_eq!(buffer.samples(), &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn negative_samples_clamp_to_zero() {
        let mut buffer = SampleBuffer::new(4);
        buffer.push(-12.5);
        assert_eq!(buffer.samples(), &[0.0]);
    }

    #[test]
    fn speedometer_ratio_saturates() {
        let gauge = Speedometer::new(1200.0);
        assert_eq!(gauge.ratio(600.0), 0.5);
        assert_eq!(gauge.ratio(5000.0), 1.0);
        assert_eq!(gauge.ratio(-3.0), 0.0);
        assert_eq!(gauge.ratio(f64::NAN), 0.0);
    }

    #[test]
    fn speedometer_ceiling_has_a_floor() {
        let gauge = Speedometer::new(0.0);
        assert_eq!(gauge.max_mbps(), 1.0);
        assert_eq!(gauge.ratio(0.5), 0.5);
    }
}
