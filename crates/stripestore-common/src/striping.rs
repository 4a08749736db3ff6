//! RAID0 striping policy
//!
//! A file is cut into fixed-size objects. Object `n` lives on the OSD at
//! position `n % width` of the replica's OSD list; objects with the same
//! `n / width` form a row.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Striping policy descriptor for one replica of a file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripingPolicy {
    /// Size of one object in bytes
    pub stripe_size: u32,
    /// Number of OSDs the file is striped across
    pub width: u32,
    /// Position of this OSD within the stripe (0-based)
    pub relative_position: u32,
}

impl StripingPolicy {
    /// Create and validate a striping policy
    pub fn new(stripe_size: u32, width: u32, relative_position: u32) -> Result<Self> {
        let policy = Self {
            stripe_size,
            width,
            relative_position,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Policy for an unstriped file held entirely by this OSD
    #[must_use]
    pub const fn single(stripe_size: u32) -> Self {
        Self {
            stripe_size,
            width: 1,
            relative_position: 0,
        }
    }

    /// Check the descriptor for impossible values
    pub fn validate(&self) -> Result<()> {
        if self.stripe_size == 0 {
            return Err(Error::invalid_params("stripe size must be positive"));
        }
        if self.width == 0 {
            return Err(Error::invalid_params("stripe width must be positive"));
        }
        if self.relative_position >= self.width {
            return Err(Error::invalid_params(format!(
                "relative position {} outside stripe width {}",
                self.relative_position, self.width
            )));
        }
        Ok(())
    }

    /// Stripe size as u64
    #[inline]
    #[must_use]
    pub const fn stripe_size_u64(&self) -> u64 {
        self.stripe_size as u64
    }

    /// Object number containing the given byte offset
    #[inline]
    #[must_use]
    pub const fn object_for_offset(&self, offset: u64) -> u64 {
        offset / self.stripe_size_u64()
    }

    /// One past the last byte offset of an object, `None` if it overflows
    #[inline]
    #[must_use]
    pub const fn checked_object_end(&self, object_number: u64) -> Option<u64> {
        match object_number.checked_add(1) {
            Some(n) => n.checked_mul(self.stripe_size_u64()),
            None => None,
        }
    }

    /// Reject object numbers whose byte range is not addressable
    pub fn check_object_number(&self, object_number: u64) -> Result<()> {
        match self.checked_object_end(object_number) {
            Some(_) => Ok(()),
            None => Err(Error::invalid_params(format!(
                "object {object_number} is beyond the addressable file size"
            ))),
        }
    }

    /// First byte offset of an object
    ///
    /// Saturates for object numbers rejected by `check_object_number`.
    #[inline]
    #[must_use]
    pub const fn object_start_offset(&self, object_number: u64) -> u64 {
        object_number.saturating_mul(self.stripe_size_u64())
    }

    /// Last byte offset of an object (inclusive)
    #[inline]
    #[must_use]
    pub const fn object_end_offset(&self, object_number: u64) -> u64 {
        match self.checked_object_end(object_number) {
            Some(end) => end - 1,
            None => u64::MAX,
        }
    }

    /// Row of an object within the striping pattern
    #[inline]
    #[must_use]
    pub const fn row(&self, object_number: u64) -> u64 {
        object_number / self.width as u64
    }

    /// Stripe position of the OSD responsible for an object
    #[inline]
    #[must_use]
    pub const fn osd_for_object(&self, object_number: u64) -> u32 {
        (object_number % self.width as u64) as u32
    }

    /// Whether an object is stored on this OSD
    #[inline]
    #[must_use]
    pub const fn is_local_object(&self, object_number: u64) -> bool {
        self.osd_for_object(object_number) == self.relative_position
    }

    /// Local object numbers in the half-open range `[from, to)`
    pub fn local_objects_in(&self, from: u64, to: u64) -> impl Iterator<Item = u64> + '_ {
        let width = u64::from(self.width);
        let pos = u64::from(self.relative_position);
        let first = if from % width <= pos {
            from - from % width + pos
        } else {
            from - from % width + width + pos
        };
        (first..to).step_by(self.width as usize)
    }

    /// Highest local object number at or below `object_number`
    #[must_use]
    pub const fn last_local_object(&self, object_number: u64) -> Option<u64> {
        let pos = self.relative_position as u64;
        if object_number < pos {
            None
        } else {
            Some(object_number - (object_number - pos) % self.width as u64)
        }
    }

    /// Last object number of a file of the given size, `None` for an empty file
    #[must_use]
    pub const fn last_object_for_size(&self, file_size: u64) -> Option<u64> {
        if file_size == 0 {
            None
        } else {
            Some(self.object_for_offset(file_size - 1))
        }
    }

    /// File size implied by object `object_number` holding `length` bytes
    #[inline]
    #[must_use]
    pub const fn file_size_after(&self, object_number: u64, length: u64) -> u64 {
        self.object_start_offset(object_number).saturating_add(length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets() {
        let sp = StripingPolicy::single(1024);
        assert_eq!(sp.object_for_offset(0), 0);
        assert_eq!(sp.object_for_offset(1023), 0);
        assert_eq!(sp.object_for_offset(1024), 1);
        assert_eq!(sp.object_start_offset(3), 3072);
        assert_eq!(sp.object_end_offset(3), 4095);
        assert_eq!(sp.file_size_after(2, 10), 2058);
    }

    #[test]
    fn test_object_number_range() {
        let sp = StripingPolicy::single(1024);
        assert!(sp.check_object_number(0).is_ok());
        assert!(sp.check_object_number(u64::MAX / 1024 - 1).is_ok());
        assert!(sp.check_object_number(u64::MAX / 2).is_err());
        assert!(sp.check_object_number(u64::MAX).is_err());
        assert_eq!(sp.checked_object_end(u64::MAX), None);
        assert_eq!(sp.object_start_offset(u64::MAX / 2), u64::MAX);
        assert_eq!(sp.object_end_offset(u64::MAX), u64::MAX);
        assert_eq!(sp.file_size_after(u64::MAX / 2, 1), u64::MAX);
    }

    #[test]
    fn test_last_object_for_size() {
        let sp = StripingPolicy::single(1024);
        assert_eq!(sp.last_object_for_size(0), None);
        assert_eq!(sp.last_object_for_size(1), Some(0));
        assert_eq!(sp.last_object_for_size(1024), Some(0));
        assert_eq!(sp.last_object_for_size(1025), Some(1));
    }

    #[test]
    fn test_locality_and_rows() {
        let sp = StripingPolicy::new(64, 3, 1).unwrap();
        assert!(!sp.is_local_object(0));
        assert!(sp.is_local_object(1));
        assert!(sp.is_local_object(4));
        assert_eq!(sp.row(4), 1);
        assert_eq!(sp.osd_for_object(5), 2);

        let local: Vec<u64> = sp.local_objects_in(0, 11).collect();
        assert_eq!(local, vec![1, 4, 7, 10]);

        let local: Vec<u64> = sp.local_objects_in(5, 11).collect();
        assert_eq!(local, vec![7, 10]);

        let local: Vec<u64> = sp.local_objects_in(4, 5).collect();
        assert_eq!(local, vec![4]);

        assert_eq!(sp.last_local_object(0), None);
        assert_eq!(sp.last_local_object(1), Some(1));
        assert_eq!(sp.last_local_object(6), Some(4));
    }

    #[test]
    fn test_single_width_is_all_local() {
        let sp = StripingPolicy::single(4096);
        assert_eq!(sp.local_objects_in(2, 6).count(), 4);
    }

    #[test]
    fn test_validate() {
        assert!(StripingPolicy::new(0, 1, 0).is_err());
        assert!(StripingPolicy::new(1024, 0, 0).is_err());
        assert!(StripingPolicy::new(1024, 2, 2).is_err());
        assert!(StripingPolicy::new(1024, 2, 1).is_ok());
    }
}
