//! Engine configuration.

use glam::Vec4;

/// Number of command buffers the frame scheduler rotates through.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Backend selection for the rendering core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// wgpu backend, requires a window to present to
    #[default]
    Wgpu,
    /// No-op backend for headless runs and tests
    Dummy,
}

/// Coarse quality preset. Higher tiers trade GPU time for image quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum QualityTier {
    Low,
    #[default]
    Medium,
    High,
    Ultra,
}

impl QualityTier {
    /// MSAA sample count requested by this tier.
    pub fn msaa_samples(self) -> u32 {
        match self {
            QualityTier::Low => 1,
            QualityTier::Medium => 2,
            QualityTier::High => 4,
            QualityTier::Ultra => 8,
        }
    }

    /// Whether the tier asks for an HDR swapchain.
    pub fn wants_hdr(self) -> bool {
        matches!(self, QualityTier::Ultra)
    }
}

/// Configuration for initializing the rendering core.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Which backend to use
    pub backend: BackendType,
    /// Initial surface width
    pub width: u32,
    /// Initial surface height
    pub height: u32,
    /// Enable multisampled rendering
    pub msaa_enabled: bool,
    /// Requested sample count when MSAA is enabled
    pub msaa_samples: u32,
    /// Prefer a floating point swapchain format
    pub hdr: bool,
    /// Frame rate cap, 0 disables the limiter
    pub target_fps: u32,
    /// Enable vsync
    pub vsync: bool,
    /// Frames the CPU may record ahead of the GPU. Fixed at [`MAX_FRAMES_IN_FLIGHT`].
    pub max_frames_in_flight: usize,
    /// Ask the adapter selection for a high performance GPU
    pub prefer_discrete_gpu: bool,
    /// Retry with a software adapter if no hardware adapter is found
    pub allow_software_fallback: bool,
    /// Upper bound on live buffer and texture memory, in bytes
    pub memory_budget: Option<u64>,
    /// Quality preset the MSAA and HDR options were derived from
    pub quality: QualityTier,
    /// Color the first render pass of each frame clears to
    pub clear_color: Vec4,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Wgpu,
            width: 1280,
            height: 720,
            msaa_enabled: false,
            msaa_samples: 4,
            hdr: false,
            target_fps: 0,
            vsync: true,
            max_frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            prefer_discrete_gpu: true,
            allow_software_fallback: true,
            memory_budget: None,
            quality: QualityTier::Medium,
            clear_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
        }
    }
}

impl RenderConfig {
    /// Configuration derived from a quality preset.
    pub fn for_quality(quality: QualityTier) -> Self {
        let samples = quality.msaa_samples();
        Self {
            msaa_enabled: samples > 1,
            msaa_samples: samples,
            hdr: quality.wants_hdr(),
            quality,
            ..Self::default()
        }
    }

    /// Headless configuration backed by the dummy backend.
    pub fn headless() -> Self {
        Self {
            backend: BackendType::Dummy,
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_msaa(mut self, samples: u32) -> Self {
        self.msaa_enabled = samples > 1;
        self.msaa_samples = samples.max(1);
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = fps;
        self
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    pub fn with_clear_color(mut self, color: Vec4) -> Self {
        self.clear_color = color;
        self
    }

    /// Normalize options that the core does not support changing.
    pub(crate) fn sanitized(mut self) -> Self {
        if self.max_frames_in_flight != MAX_FRAMES_IN_FLIGHT {
            log::warn!(
                "max_frames_in_flight = {} is not supported, using {}",
                self.max_frames_in_flight,
                MAX_FRAMES_IN_FLIGHT
            );
            self.max_frames_in_flight = MAX_FRAMES_IN_FLIGHT;
        }
        if !self.msaa_samples.is_power_of_two() {
            let rounded = self.msaa_samples.max(1).next_power_of_two();
            log::warn!(
                "MSAA sample count {} is not a power of two, using {}",
                self.msaa_samples,
                rounded
            );
            self.msaa_samples = rounded;
        }
        self.width = self.width.max(1);
        self.height = self.height.max(1);
        self
    }

    /// Sample count to render with, given the counts the device supports.
    pub fn effective_sample_count(&self, supported: &[u32]) -> u32 {
        if !self.msaa_enabled {
            return 1;
        }
        supported
            .iter()
            .copied()
            .filter(|&count| count <= self.msaa_samples)
            .max()
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::low(QualityTier::Low, false, 1)]
    #[case::medium(QualityTier::Medium, true, 2)]
    #[case::high(QualityTier::High, true, 4)]
    #[case::ultra(QualityTier::Ultra, true, 8)]
    fn test_quality_presets(#[case] tier: QualityTier, #[case] msaa: bool, #[case] samples: u32) {
        let config = RenderConfig::for_quality(tier);
        assert_eq!(config.msaa_enabled, msaa);
        assert_eq!(config.msaa_samples, samples);
        assert_eq!(config.hdr, tier == QualityTier::Ultra);
    }

    #[test]
    fn test_frames_in_flight_is_fixed() {
        let config = RenderConfig {
            max_frames_in_flight: 3,
            ..RenderConfig::default()
        }
        .sanitized();
        assert_eq!(config.max_frames_in_flight, MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn test_effective_sample_count() {
        let config = RenderConfig::default().with_msaa(8);
        assert_eq!(config.effective_sample_count(&[1, 4]), 4);
        assert_eq!(config.effective_sample_count(&[1]), 1);

        let config = RenderConfig::default();
        assert_eq!(config.effective_sample_count(&[1, 4, 8]), 1);
    }

    #[test]
    fn test_sample_count_rounded_to_power_of_two() {
        let config = RenderConfig::default().with_msaa(3).sanitized();
        assert_eq!(config.msaa_samples, 4);
    }
}
