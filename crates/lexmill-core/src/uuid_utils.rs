//! UUIDv7 helpers for time-ordered job identifiers.

use uuid::Uuid;

/// Generate a new time-ordered UUIDv7.
///
/// Ids from one process sort in creation order, which the driver relies on
/// when it walks active jobs round-robin.
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_v7_version() {
        assert_eq!(new_v7().get_version_num(), 7);
    }

    #[test]
    fn test_v7_ordering() {
        let ids: Vec<Uuid> = (0..64).map(|_| new_v7()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
