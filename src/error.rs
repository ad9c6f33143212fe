//! Error types for the frame core.
//!
//! Internal components return [`GraphicsResult`]. The [`RenderEngine`](crate::RenderEngine)
//! boundary turns these into `bool`, `Option` or [`ResourceId::INVALID`](crate::ResourceId)
//! sentinels after logging them.

use thiserror::Error;

use crate::shader::ShaderDescriptor;

/// Errors produced by the rendering core and its backends.
#[derive(Error, Debug)]
pub enum GraphicsError {
    // ========================================================================
    // Lifecycle
    // ========================================================================
    /// Adapter, device or surface acquisition failed.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// An operation needed an initialized engine.
    #[error("engine is not initialized")]
    NotInitialized,

    /// Frame operations were called out of order.
    #[error("frame sequencing error: {0}")]
    FrameSequence(String),

    /// A command was submitted while no frame was recording.
    #[error("no frame is being recorded")]
    NotRecording,

    /// The device was lost and must be recreated.
    #[error("GPU device lost")]
    DeviceLost,

    // ========================================================================
    // Shaders
    // ========================================================================
    /// Shader source failed to preprocess, parse or validate.
    #[error("shader compilation failed for {label}: {message}")]
    Compilation { label: String, message: String },

    /// The requested feature (usually a shader language) is not available.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    // ========================================================================
    // Resources
    // ========================================================================
    /// The device or the configured memory budget could not satisfy an allocation.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Native resource creation failed for a reason other than memory.
    #[error("resource creation failed: {0}")]
    ResourceCreation(String),

    /// A caller-provided argument was rejected.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    // ========================================================================
    // Presentation
    // ========================================================================
    /// The surface was lost and needs to be reconfigured.
    #[error("surface lost, needs reconfiguration")]
    SurfaceLost,

    /// The surface no longer matches the window and needs to be reconfigured.
    #[error("surface outdated, needs reconfiguration")]
    SurfaceOutdated,

    /// Acquiring the next surface texture timed out.
    #[error("timed out acquiring the next surface texture")]
    SurfaceTimeout,

    // ========================================================================
    // Persistence
    // ========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted shader cache file is malformed.
    #[error("invalid shader cache file: {0}")]
    CacheFormat(String),
}

impl GraphicsError {
    /// Whether the caller can retry the frame after reconfiguring the surface.
    pub fn is_surface_error(&self) -> bool {
        matches!(
            self,
            Self::SurfaceLost | Self::SurfaceOutdated | Self::SurfaceTimeout
        )
    }
}

/// Result alias used across the crate.
pub type GraphicsResult<T> = Result<T, GraphicsError>;

/// A failed shader compilation, handed to the compiler's error callback.
#[derive(Error, Debug, Clone)]
#[error(
    "{} ({:?} stage, entry `{}`): {message}",
    .descriptor.label(),
    .descriptor.stage(),
    .descriptor.entry_point()
)]
pub struct CompilationError {
    /// The descriptor that failed to compile.
    pub descriptor: ShaderDescriptor,
    /// Human readable diagnostic.
    pub message: String,
}

impl From<CompilationError> for GraphicsError {
    fn from(err: CompilationError) -> Self {
        Self::Compilation {
            label: err.descriptor.label().to_string(),
            message: err.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::ShaderStage;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::SurfaceLost;
        assert_eq!(err.to_string(), "surface lost, needs reconfiguration");

        let err = GraphicsError::Initialization("no adapter found".to_string());
        assert_eq!(err.to_string(), "initialization failed: no adapter found");
    }

    #[test]
    fn test_surface_errors_are_recoverable() {
        assert!(GraphicsError::SurfaceOutdated.is_surface_error());
        assert!(GraphicsError::SurfaceTimeout.is_surface_error());
        assert!(!GraphicsError::DeviceLost.is_surface_error());
    }

    #[test]
    fn test_compilation_error_conversion() {
        let descriptor =
            ShaderDescriptor::new(ShaderStage::Vertex, "fn main() {}", "vs_main").with_label("quad");
        let err = CompilationError {
            descriptor,
            message: "entry point missing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "quad (Vertex stage, entry `vs_main`): entry point missing"
        );
        let source: &dyn std::error::Error = &err;
        assert!(source.source().is_none());

        let converted: GraphicsError = err.into();
        assert!(matches!(
            converted,
            GraphicsError::Compilation { ref label, .. } if label == "quad"
        ));
    }
}
