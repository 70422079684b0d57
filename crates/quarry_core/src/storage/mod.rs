//! Storage structures used by join and aggregation work orders.

pub mod aggregation;
pub mod column_vector;
pub mod compact_key_hash_table;
pub mod memory;
pub mod types;
pub mod value_accessor;
