//! Copy-on-write policy of a file handle
//!
//! A policy belongs to one open handle, not to a file: two handles on the
//! same file may apply different modes.

use crate::bitmap::ObjectBitmap;
use serde::{Deserialize, Serialize};

/// Copy-on-write mode requested when a file is opened
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CowMode {
    /// Always overwrite in place
    #[default]
    NoCow,
    /// Every write creates a new object version
    AlwaysCow,
    /// Only the first write to each pre-existing object creates a new version
    CowOnce,
}

/// Copy-on-write decision state of one file handle
#[derive(Clone, Debug, Default)]
pub struct CowPolicy {
    mode: CowMode,
    copied: Option<ObjectBitmap>,
}

impl CowPolicy {
    #[must_use]
    pub const fn new(mode: CowMode) -> Self {
        Self { mode, copied: None }
    }

    #[must_use]
    pub const fn mode(&self) -> CowMode {
        self.mode
    }

    /// Whether old object versions are retained by this handle
    #[must_use]
    pub fn cow_enabled(&self) -> bool {
        self.mode != CowMode::NoCow
    }

    /// Whether the copied flags still need to be sized
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.mode != CowMode::CowOnce || self.copied.is_some()
    }

    /// Size the copied flags to the object count seen at first use
    ///
    /// Only the first call has an effect; the bitmap never grows afterwards.
    pub fn init_cow_flags(&mut self, initial_object_count: u64) {
        if self.mode == CowMode::CowOnce && self.copied.is_none() {
            self.copied = Some(ObjectBitmap::new(initial_object_count));
        }
    }

    /// Whether a write to `object_number` must create a new version
    #[must_use]
    pub fn is_cow(&self, object_number: u64) -> bool {
        match self.mode {
            CowMode::NoCow => false,
            CowMode::AlwaysCow => true,
            CowMode::CowOnce => match &self.copied {
                // objects created after open never need a copy
                Some(copied) => object_number < copied.len() && !copied.get(object_number),
                None => false,
            },
        }
    }

    /// Record that `object_number` has been copied by this handle
    pub fn object_changed(&mut self, object_number: u64) {
        if let Some(copied) = &mut self.copied {
            copied.set_within(object_number);
        }
    }

    /// Number of objects the file had when the handle was first used
    #[must_use]
    pub fn initial_object_count(&self) -> Option<u64> {
        self.copied.as_ref().map(ObjectBitmap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cow() {
        let mut policy = CowPolicy::new(CowMode::NoCow);
        policy.init_cow_flags(10);
        assert!(policy.is_initialized());
        assert!(!policy.cow_enabled());
        assert!(!policy.is_cow(0));
        assert!(!policy.is_cow(100));
    }

    #[test]
    fn test_always_cow() {
        let mut policy = CowPolicy::new(CowMode::AlwaysCow);
        assert!(policy.is_cow(0));
        policy.object_changed(0);
        assert!(policy.is_cow(0));
        assert!(policy.is_cow(1_000_000));
    }

    #[test]
    fn test_cow_once() {
        let mut policy = CowPolicy::new(CowMode::CowOnce);
        assert!(!policy.is_initialized());

        policy.init_cow_flags(3);
        assert!(policy.is_initialized());
        assert_eq!(policy.initial_object_count(), Some(3));

        assert!(policy.is_cow(1));
        policy.object_changed(1);
        assert!(!policy.is_cow(1));
        assert!(policy.is_cow(2));

        // objects created after open
        assert!(!policy.is_cow(3));
        policy.object_changed(5);
        assert!(!policy.is_cow(5));
    }

    #[test]
    fn test_cow_once_bitmap_size_is_fixed() {
        let mut policy = CowPolicy::new(CowMode::CowOnce);
        policy.init_cow_flags(2);
        policy.init_cow_flags(50);
        assert_eq!(policy.initial_object_count(), Some(2));
        assert!(!policy.is_cow(10));
    }
}
