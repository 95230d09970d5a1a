// Frame rate tracking for the window title

use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsSample {
    pub fps: f32,
    pub frame_ms: f32,
}

#[derive(Debug)]
pub struct FpsCounter {
    frame_count: u32,
    last_report: Instant,
    last_frame: Instant,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            frame_count: 0,
            last_report: now,
            last_frame: now,
        }
    }

    /// Count a presented frame. Yields a sample about once per second.
    pub fn tick(&mut self, now: Instant) -> Option<FpsSample> {
        let frame_time = now.saturating_duration_since(self.last_frame);
        self.last_frame = now;
        self.frame_count += 1;

        let elapsed = now.saturating_duration_since(self.last_report);
        if elapsed < REPORT_INTERVAL {
            return None;
        }

        let sample = FpsSample {
            fps: self.frame_count as f32 / elapsed.as_secs_f32(),
            frame_ms: frame_time.as_secs_f32() * 1000.0,
        };

        self.frame_count = 0;
        self.last_report = now;
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_sample_before_interval() {
        let start = Instant::now();
        let mut counter = FpsCounter::new(start);

        for i in 1..10 {
            assert!(counter.tick(start + Duration::from_millis(i * 100)).is_none());
        }
    }

    #[test]
    fn reports_average_over_interval() {
        let start = Instant::now();
        let mut counter = FpsCounter::new(start);

        let mut sample = None;
        for i in 1..=60 {
            sample = counter.tick(start + Duration::from_micros(i * 16_667));
        }

        let sample = sample.expect("60 frames at 60 Hz span one second");
        assert!((sample.fps - 60.0).abs() < 0.1, "fps = {}", sample.fps);
        assert!((sample.frame_ms - 16.667).abs() < 0.01);
    }

    #[test]
    fn counter_restarts_after_report() {
        let start = Instant::now();
        let mut counter = FpsCounter::new(start);

        assert!(counter.tick(start + Duration::from_secs(1)).is_some());
        assert!(counter.tick(start + Duration::from_millis(1500)).is_none());

        let sample = counter.tick(start + Duration::from_secs(2)).unwrap();
        assert!((sample.fps - 2.0).abs() < 1e-4);
    }
}
