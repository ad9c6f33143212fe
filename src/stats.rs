//! Frame statistics.

use std::time::Duration;

use parking_lot::Mutex;

/// Counters and timing reported by [`RenderEngine::get_stats`](crate::RenderEngine::get_stats).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderStats {
    pub draw_calls: u64,
    pub triangles: u64,
    pub vertices: u64,
    pub compute_dispatches: u64,
    /// Frames presented since the last reset
    pub frames: u64,
    /// Duration of the last presented frame in milliseconds
    pub frame_time_ms: f64,
    /// Smoothed frames per second
    pub fps: f64,
    /// Successful shader compilations (never reset)
    pub shaders_compiled: u64,
    pub shader_cache_hits: u64,
    pub shader_errors: u64,
    /// Live registry resources
    pub resources: usize,
    /// Bytes charged against the memory budget
    pub memory_usage: u64,
}

/// Weight of the newest sample in the fps moving average.
const FPS_SMOOTHING: f64 = 0.1;

/// Accumulates per-frame counters behind their own lock.
#[derive(Debug, Default)]
pub struct StatsTracker {
    stats: Mutex<RenderStats>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_draw(&self, vertices: u64, triangles: u64) {
        let mut stats = self.stats.lock();
        stats.draw_calls += 1;
        stats.vertices += vertices;
        stats.triangles += triangles;
    }

    pub fn record_dispatch(&self) {
        self.stats.lock().compute_dispatches += 1;
    }

    /// Record a presented frame that took `frame_time`.
    pub fn record_frame(&self, frame_time: Duration) {
        let mut stats = self.stats.lock();
        stats.frames += 1;
        let ms = frame_time.as_secs_f64() * 1000.0;
        stats.frame_time_ms = ms;
        if ms > 0.0 {
            let instant = 1000.0 / ms;
            stats.fps = if stats.fps == 0.0 {
                instant
            } else {
                stats.fps + (instant - stats.fps) * FPS_SMOOTHING
            };
        }
    }

    pub fn snapshot(&self) -> RenderStats {
        self.stats.lock().clone()
    }

    pub fn reset(&self) {
        *self.stats.lock() = RenderStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draws_accumulate() {
        let tracker = StatsTracker::new();
        tracker.record_draw(6, 2);
        tracker.record_draw(3, 1);
        tracker.record_dispatch();

        let stats = tracker.snapshot();
        assert_eq!(stats.draw_calls, 2);
        assert_eq!(stats.vertices, 9);
        assert_eq!(stats.triangles, 3);
        assert_eq!(stats.compute_dispatches, 1);
    }

    #[test]
    fn test_frame_timing() {
        let tracker = StatsTracker::new();
        tracker.record_frame(Duration::from_millis(10));
        let stats = tracker.snapshot();
        assert_eq!(stats.frames, 1);
        assert!((stats.frame_time_ms - 10.0).abs() < 1e-9);
        assert!((stats.fps - 100.0).abs() < 1e-6);

        tracker.record_frame(Duration::from_millis(20));
        let fps = tracker.snapshot().fps;
        assert!(fps < 100.0 && fps > 50.0);
    }

    #[test]
    fn test_reset() {
        let tracker = StatsTracker::new();
        tracker.record_draw(3, 1);
        tracker.record_frame(Duration::from_millis(16));
        tracker.reset();
        assert_eq!(tracker.snapshot(), RenderStats::default());
    }
}
