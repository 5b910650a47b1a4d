//! Packet identifiers for `QoS` 1 publishes

use std::sync::atomic::{AtomicU16, Ordering};

/// Hands out packet identifiers in the range 1..=65535, wrapping past the top
///
/// Shared by every device task through the connection manager, so it is
/// lock free.
#[derive(Debug)]
pub struct PacketIdGenerator {
    next_id: AtomicU16,
}

impl PacketIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU16::new(1),
        }
    }

    /// Returns the next identifier; zero is never produced
    #[must_use]
    pub fn next(&self) -> u16 {
        let advance = |current: u16| Some(current.checked_add(1).unwrap_or(1));
        match self
            .next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, advance)
        {
            Ok(previous) | Err(previous) => previous,
        }
    }

    /// Returns the next identifier for which `in_use` is false
    ///
    /// Gives up after one full cycle and returns `None` when every
    /// identifier is taken.
    pub fn next_free(&self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        (0..u16::MAX).map(|_| self.next()).find(|id| !in_use(*id))
    }
}

impl Default for PacketIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequential_ids() {
        let ids = PacketIdGenerator::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
    }

    #[test]
    fn test_wraps_to_one() {
        let ids = PacketIdGenerator::new();
        ids.next_id.store(u16::MAX, Ordering::SeqCst);

        assert_eq!(ids.next(), u16::MAX);
        assert_eq!(ids.next(), 1);
    }

    #[test]
    fn test_next_free_skips_in_flight() {
        let ids = PacketIdGenerator::new();
        let in_flight: HashSet<u16> = [1, 2, 4].into_iter().collect();
        assert_eq!(ids.next_free(|id| in_flight.contains(&id)), Some(3));
        assert_eq!(ids.next_free(|id| in_flight.contains(&id)), Some(5));
        assert_eq!(ids.next_free(|_| true), None);
    }

    #[tokio::test]
    async fn test_unique_across_tasks() {
        let ids = Arc::new(PacketIdGenerator::new());
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let ids = Arc::clone(&ids);
            tasks.spawn(async move { (0..100).map(|_| ids.next()).collect::<Vec<_>>() });
        }

        let mut seen = HashSet::new();
        while let Some(batch) = tasks.join_next().await {
            for id in batch.unwrap() {
                assert!(seen.insert(id), "duplicate packet id {id}");
            }
        }
        assert_eq!(seen.len(), 800);
    }
}
