//! Live-stream port allocation

use std::collections::HashSet;

/// Linear-probe allocator for live-stream ports
///
/// Candidates advance from the last assigned port; a port is free when no
/// running live-stream server reports it. Freed ports are only handed out
/// again after the allocator wraps.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    last: u16,
}

impl PortAllocator {
    /// Allocate ports above `base` (the control port)
    pub fn new(base: u16) -> Self {
        Self { base, last: base }
    }

    /// Next port above the last assigned one that is not in `in_use`
    pub fn next(&mut self, in_use: &HashSet<u16>) -> Option<u16> {
        let mut candidate = self.last;
        for _ in 0..u16::MAX {
            candidate = if candidate == u16::MAX {
                self.base.saturating_add(1)
            } else {
                candidate + 1
            };
            if candidate != self.base && !in_use.contains(&candidate) {
                self.last = candidate;
                return Some(candidate);
            }
        }
        None
    }

    pub fn last(&self) -> u16 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_above_base() {
        let mut ports = PortAllocator::new(8080);
        assert_eq!(ports.next(&HashSet::new()), Some(8081));
        assert_eq!(ports.next(&HashSet::new()), Some(8082));
        assert_eq!(ports.last(), 8082);
    }

    #[test]
    fn test_skips_ports_in_use() {
        let mut ports = PortAllocator::new(8080);
        let in_use: HashSet<u16> = [8081, 8082, 8084].into_iter().collect();

        assert_eq!(ports.next(&in_use), Some(8083));
        assert_eq!(ports.next(&in_use), Some(8085));
    }

    #[test]
    fn test_distinct_under_repeated_allocation() {
        let mut ports = PortAllocator::new(9000);
        let mut in_use = HashSet::new();
        for _ in 0..32 {
            let port = ports.next(&in_use).unwrap();
            assert!(in_use.insert(port));
        }
        assert_eq!(in_use.len(), 32);
    }

    #[test]
    fn test_wraps_past_the_top() {
        let mut ports = PortAllocator::new(65532);
        let in_use: HashSet<u16> = [65533].into_iter().collect();

        assert_eq!(ports.next(&in_use), Some(65534));
        assert_eq!(ports.next(&in_use), Some(65535));
        assert_eq!(ports.next(&in_use), Some(65534));
    }
}
