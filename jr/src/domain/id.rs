//! Identifier generation
//!
//! UUID v7 gives time-ordered ids, which keeps storage scans over freshly
//! created entities roughly insertion-ordered.

/// Generate a new unique identifier.
pub fn generate_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
