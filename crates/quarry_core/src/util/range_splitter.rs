use std::ops::Range;

use quarry_error::{DbError, Result};

/// Splits a contiguous range into (nearly) equally sized partitions.
///
/// Used to divide slot and bucket arrays between workers so that each
/// partition can be processed independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSplitter {
    begin: usize,
    end: usize,
    num_partitions: usize,
    partition_length: usize,
}

impl RangeSplitter {
    /// Create a splitter with exactly `num_partitions` partitions.
    ///
    /// The number of partitions is clamped so that no partition is empty
    /// (an empty range still produces a single empty partition).
    pub fn create_with_num_partitions(
        begin: usize,
        end: usize,
        num_partitions: usize,
    ) -> Result<Self> {
        if begin > end {
            return Err(DbError::new("Range begin after end")
                .with_field("begin", begin)
                .with_field("end", end));
        }
        if num_partitions == 0 {
            return Err(DbError::new("Cannot split range into zero partitions"));
        }

        let len = end - begin;
        let num_partitions = num_partitions.min(len.max(1));
        let partition_length = len.div_ceil(num_partitions);
        // Recompute so trailing partitions aren't empty.
        let num_partitions = if partition_length == 0 {
            1
        } else {
            len.div_ceil(partition_length)
        };

        Ok(RangeSplitter {
            begin,
            end,
            num_partitions,
            partition_length,
        })
    }

    /// Create a splitter where every partition has at least
    /// `min_partition_length` elements (except possibly the last), and there
    /// are at most `max_num_partitions` partitions.
    pub fn create_with_partition_length(
        begin: usize,
        end: usize,
        min_partition_length: usize,
        max_num_partitions: usize,
    ) -> Result<Self> {
        if min_partition_length == 0 {
            return Err(DbError::new("Minimum partition length must be non-zero"));
        }
        let len = end.saturating_sub(begin);
        let num_partitions = (len / min_partition_length).clamp(1, max_num_partitions.max(1));
        Self::create_with_num_partitions(begin, end, num_partitions)
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Get the range for the partition at `idx`.
    pub fn partition(&self, idx: usize) -> Result<Range<usize>> {
        if idx >= self.num_partitions {
            return Err(DbError::new("Partition index out of range")
                .with_field("idx", idx)
                .with_field("num_partitions", self.num_partitions));
        }

        let start = (self.begin + idx * self.partition_length).min(self.end);
        let end = (start + self.partition_length).min(self.end);

        Ok(start..end)
    }

    /// Iterate over all partition ranges in order.
    pub fn partitions(&self) -> impl ExactSizeIterator<Item = Range<usize>> + '_ {
        (0..self.num_partitions).map(|idx| {
            let start = (self.begin + idx * self.partition_length).min(self.end);
            start..(start + self.partition_length).min(self.end)
        })
    }
}
