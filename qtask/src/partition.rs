use rand::Rng;

use crate::error::ConfigError;

/// Maps partition keys to partition indexes and physical stream names.
///
/// Every producer and consumer of a logical topic must agree on
/// `total_partitions`; the mapping is part of the wire contract, so the hash
/// below must stay bit-for-bit identical to the Java `String.hashCode`
/// recurrence used by producers in other languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    total_partitions: u32,
}

impl Partitioner {
    pub fn new(total_partitions: u32) -> Result<Self, ConfigError> {
        if total_partitions == 0 {
            return Err(ConfigError::InvalidTotalPartitions);
        }
        Ok(Self { total_partitions })
    }

    pub fn total_partitions(&self) -> u32 {
        self.total_partitions
    }

    /// Resolve the partition index for a key.
    ///
    /// A `None` key spreads load by drawing a uniformly random index.
    pub fn partition_for(&self, key: Option<&str>) -> u32 {
        match key {
            Some(key) => java_string_hash(key).unsigned_abs() % self.total_partitions,
            None => rand::thread_rng().gen_range(0..self.total_partitions),
        }
    }

    /// Physical stream name for one partition of a logical topic.
    pub fn stream_name(&self, base_topic: &str, index: u32) -> Result<String, ConfigError> {
        if index >= self.total_partitions {
            return Err(ConfigError::InvalidPartitionIndex {
                index,
                total: self.total_partitions,
            });
        }
        Ok(format!("{base_topic}:{index}"))
    }

    /// Resolve both the partition index and the stream name for a key.
    pub fn stream_for(&self, base_topic: &str, key: Option<&str>) -> (u32, String) {
        let index = self.partition_for(key);
        (index, format!("{base_topic}:{index}"))
    }
}

/// The classic 32-bit multiplicative string hash: `h = 31 * h + c` with
/// wrap-around, over UTF-16 code units, seeded at 0.
pub fn java_string_hash(key: &str) -> i32 {
    key.encode_utf16().fold(0i32, |h, unit| {
        h.wrapping_shl(5).wrapping_sub(h).wrapping_add(i32::from(unit))
    })
}
