//! Error numbers reported by the allocation entry points.
//!
//! Values match Linux so the ABI layer can hand them to C callers unchanged.

/// Out of memory.
pub const ENOMEM: i32 = 12;
/// Invalid argument.
pub const EINVAL: i32 = 22;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_linux() {
        assert_eq!(ENOMEM, 12);
        assert_eq!(EINVAL, 22);
    }
}
