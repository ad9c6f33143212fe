//! Opaque 64-bit identifiers. Zero is reserved as the invalid sentinel.

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(u64);

        impl $name {
            /// Sentinel returned when creation fails.
            pub const INVALID: Self = Self(0);

            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> u64 {
                self.0
            }

            pub const fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
}

opaque_id!(
    /// Handle to a buffer, texture or sampler owned by the resource registry.
    ResourceId
);

opaque_id!(
    /// Handle to a cached render or compute pipeline.
    PipelineId
);

opaque_id!(
    /// Content hash of a shader descriptor.
    ShaderHash
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_invalid() {
        assert!(!ResourceId::INVALID.is_valid());
        assert!(!ResourceId::default().is_valid());
        assert!(ResourceId::from_raw(7).is_valid());
        assert_eq!(PipelineId::from_raw(3).raw(), 3);
    }

    #[test]
    fn test_display() {
        assert_eq!(ResourceId::from_raw(16).to_string(), "ResourceId(0x10)");
    }
}
