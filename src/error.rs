use std::{alloc::Layout, fmt::Display};

/// Failures of the fallible construct entry points.
///
/// The panicking entry points do not produce this; they die at the failure
/// site instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstructError<E> {
    /// The allocator refused to provide memory for the payload.
    /// Nothing was mutated; retrying is safe.
    Alloc { ty: &'static str, layout: Layout },
    /// The payload initializer failed. The memory is already returned
    /// to the allocator.
    Init(E),
}

impl<E> ConstructError<E> {
    pub(crate) fn alloc<T>() -> Self {
        Self::Alloc {
            ty: std::any::type_name::<T>(),
            layout: Layout::new::<T>(),
        }
    }

    /// The initializer's error, if that is what failed.
    pub fn into_init(self) -> Option<E> {
        match self {
            Self::Init(error) => Some(error),
            Self::Alloc { .. } => None,
        }
    }
}

impl<E: Display> Display for ConstructError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alloc { ty, layout } => write!(
                f,
                "Failed to allocate {} bytes for an object of type {}.",
                layout.size(),
                ty
            ),
            Self::Init(error) => write!(f, "Failed to initialize object: {}", error),
        }
    }
}
