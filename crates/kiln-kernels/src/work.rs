//! 1D work partitioning.

use crate::error::PreconditionError;

/// Global and local work size for a one-dimensional launch.
///
/// `global` is always a multiple of `local` and covers at least the requested
/// element count. Kernels bounds-check the tail items past that count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkSize {
    pub global: usize,
    pub local: usize,
}

impl WorkSize {
    /// Round `elements` up to whole work-groups of `local` items.
    pub fn linear(
        op: &'static str,
        elements: usize,
        local: usize,
    ) -> Result<Self, PreconditionError> {
        if elements == 0 || local == 0 {
            return Err(PreconditionError::EmptyShape { op });
        }
        let groups = elements.div_ceil(local);
        let global = groups
            .checked_mul(local)
            .ok_or(PreconditionError::WorkOverflow { op })?;
        Ok(Self { global, local })
    }

    /// Number of work-groups.
    pub fn groups(&self) -> usize {
        self.global / self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_multiple() {
        let w = WorkSize::linear("t", 128, 64).unwrap();
        assert_eq!(w.global, 128);
        assert_eq!(w.groups(), 2);
    }

    #[test]
    fn test_rounds_up() {
        // 32 * 28 * 28 conv outputs with a 64-wide group
        let w = WorkSize::linear("t", 25088, 64).unwrap();
        assert_eq!(w.global, 25088);
        let w = WorkSize::linear("t", 10, 64).unwrap();
        assert_eq!(w.global, 64);
        assert_eq!(w.groups(), 1);
    }

    #[test]
    fn test_bounds_hold_for_all_small_sizes() {
        for local in [1usize, 2, 3, 7, 32, 64, 100, 256] {
            for n in 1..=1500usize {
                let w = WorkSize::linear("t", n, local).unwrap();
                assert_eq!(w.global % local, 0, "n={} local={}", n, local);
                assert!(w.global >= n, "n={} local={}", n, local);
                assert!(w.global < n + local, "n={} local={}", n, local);
            }
        }
    }

    #[test]
    fn test_zero_elements_rejected() {
        assert_eq!(
            WorkSize::linear("relu", 0, 64),
            Err(PreconditionError::EmptyShape { op: "relu" })
        );
    }

    #[test]
    fn test_overflow_rejected() {
        assert_eq!(
            WorkSize::linear("t", usize::MAX, 64),
            Err(PreconditionError::WorkOverflow { op: "t" })
        );
    }
}
