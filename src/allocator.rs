//! Free/used area bookkeeping for the container.
//!
//! The allocator never touches the container file; it only answers offset
//! questions. Three indices are kept: free areas by start offset, used
//! areas by start offset, and free areas ordered by (size, start) so the
//! smallest sufficient hole is found first.

use crate::error::{CapsuleError, Result};
use std::collections::{BTreeMap, BTreeSet};

/// A contiguous byte range inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Area {
    pub start: i64,
    pub size: i64,
}

impl Area {
    pub fn new(start: i64, size: i64) -> Self {
        Area { start, size }
    }

    /// One past the last byte of the area.
    pub fn end(&self) -> i64 {
        self.start + self.size
    }
}

/// Offset allocator over the container's record stream.
#[derive(Debug, Default)]
pub struct Allocator {
    free_by_start: BTreeMap<i64, i64>,
    used_by_start: BTreeMap<i64, i64>,
    free_by_size: BTreeSet<(i64, i64)>,
    last_position: i64,
}

impl Allocator {
    pub fn new() -> Self {
        Allocator::default()
    }

    /// Admit a known free area and advance the high-water mark.
    pub fn register_free(&mut self, area: Area) {
        self.free_by_start.insert(area.start, area.size);
        self.free_by_size.insert((area.size, area.start));
        self.last_position = self.last_position.max(area.end());
    }

    /// Admit a known used area and advance the high-water mark.
    pub fn register_used(&mut self, area: Area) {
        self.used_by_start.insert(area.start, area.size);
        self.last_position = self.last_position.max(area.end());
    }

    pub fn unregister_free(&mut self, start: i64) -> Result<Area> {
        let size = self.free_by_start.remove(&start).ok_or_else(|| {
            CapsuleError::Write(format!("no free area registered at offset {start}"))
        })?;
        self.free_by_size.remove(&(size, start));
        Ok(Area::new(start, size))
    }

    pub fn unregister_used(&mut self, start: i64) -> Result<Area> {
        let size = self.used_by_start.remove(&start).ok_or_else(|| {
            CapsuleError::Write(format!("no used area registered at offset {start}"))
        })?;
        Ok(Area::new(start, size))
    }

    /// Serve an area of at least `min_size` bytes.
    ///
    /// The smallest sufficient free area is reused when it exists; a
    /// `fitted` request only reuses an exact-size hole. Otherwise a fresh
    /// area is appended at the high-water mark - `min_size` exactly when
    /// `fitted`, rounded up to the next power of two when not, so
    /// append-heavy cells amortise their reallocations.
    pub fn allocate(&mut self, min_size: i64, fitted: bool) -> Area {
        let candidate = self
            .free_by_size
            .range((min_size, i64::MIN)..)
            .next()
            .copied();
        if let Some((size, start)) = candidate {
            if !fitted || size == min_size {
                self.free_by_size.remove(&(size, start));
                self.free_by_start.remove(&start);
                let area = Area::new(start, size);
                self.used_by_start.insert(start, size);
                self.last_position = self.last_position.max(area.end());
                return area;
            }
        }

        let size = if fitted {
            min_size
        } else {
            (min_size.max(1) as u64).next_power_of_two() as i64
        };
        let area = Area::new(self.last_position, size);
        self.register_used(area);
        area
    }

    /// Drop all state; used before re-scanning the container.
    pub fn clear(&mut self) {
        self.free_by_start.clear();
        self.used_by_start.clear();
        self.free_by_size.clear();
        self.last_position = 0;
    }

    pub fn last_position(&self) -> i64 {
        self.last_position
    }

    pub fn free_area_count(&self) -> usize {
        self.free_by_start.len()
    }

    pub fn used_area_count(&self) -> usize {
        self.used_by_start.len()
    }

    pub fn free_bytes(&self) -> i64 {
        self.free_by_start.values().sum()
    }

    /// True when the free and used areas tile `[0, last_position)` exactly.
    pub fn is_contiguous(&self) -> bool {
        let mut cursor = 0i64;
        let mut free = self.free_by_start.iter().peekable();
        let mut used = self.used_by_start.iter().peekable();
        loop {
            let next_free = free.peek().map(|(&s, &z)| (s, z));
            let next_used = used.peek().map(|(&s, &z)| (s, z));
            let (start, size) = match (next_free, next_used) {
                (Some(f), Some(u)) => {
                    if f.0 <= u.0 {
                        free.next();
                        f
                    } else {
                        used.next();
                        u
                    }
                }
                (Some(f), None) => {
                    free.next();
                    f
                }
                (None, Some(u)) => {
                    used.next();
                    u
                }
                (None, None) => return cursor == self.last_position,
            };
            if start != cursor {
                return false;
            }
            cursor = start + size;
        }
    }
}
