use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use quarry_error::{DbError, Result, not_implemented};
use tracing::debug;

use super::aggregation::AggregationHandle;
use super::column_vector::NativeColumnVector;
use super::memory::{MemoryTracker, Reservation};
use super::types::KeyType;
use super::value_accessor::{
    ColumnVectorsValueAccessor,
    MultiSourceAttributeId,
    ValueAccessorMultiplexer,
};
use crate::config::storage::HashTableConfig;
use crate::util::primes::next_prime;
use crate::util::range_splitter::RangeSplitter;

/// All key columns for a tuple packed into a single integer.
pub type KeyCode = u64;

/// Index into the key bucket array.
pub type BucketIndex = u32;

/// Packed key bytes, laid out the same as a little endian [`KeyCode`].
type KeyCodeBytes = [u8; KEY_CODE_BYTES];

const KEY_CODE_BYTES: usize = std::mem::size_of::<KeyCode>();

/// Slot or chain pointer value while a thread is allocating the bucket it
/// points to.
const EXCLUSIVE_STATE: BucketIndex = BucketIndex::MAX;

const SLOT_DATA_SIZE: usize = std::mem::size_of::<AtomicU32>();
const KEY_BUCKET_DATA_SIZE: usize = std::mem::size_of::<KeyBucket>();

/// Chain pointers store `bucket_index + 1`, zero means end of chain, and
/// `EXCLUSIVE_STATE` is reserved.
const MAX_KEY_BUCKETS: usize = (BucketIndex::MAX - 1) as usize;

#[derive(Debug)]
struct KeyBucket {
    key_code: AtomicU64,
    next: AtomicU32,
}

impl KeyBucket {
    fn zeroed() -> Self {
        KeyBucket {
            key_code: AtomicU64::new(0),
            next: AtomicU32::new(0),
        }
    }
}

/// Byte width of a single key column, specialized so packing and unpacking
/// copy a fixed number of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySize {
    One = 1,
    Two = 2,
    Three = 3,
    Four = 4,
    Five = 5,
    Six = 6,
    Seven = 7,
    Eight = 8,
}

/// Run `$body` with `$n` bound to a const equal to the key size.
macro_rules! with_key_size {
    ($size:expr, $n:ident => $body:expr) => {
        match $size {
            KeySize::One => {
                const $n: usize = 1;
                $body
            }
            KeySize::Two => {
                const $n: usize = 2;
                $body
            }
            KeySize::Three => {
                const $n: usize = 3;
                $body
            }
            KeySize::Four => {
                const $n: usize = 4;
                $body
            }
            KeySize::Five => {
                const $n: usize = 5;
                $body
            }
            KeySize::Six => {
                const $n: usize = 6;
                $body
            }
            KeySize::Seven => {
                const $n: usize = 7;
                $body
            }
            KeySize::Eight => {
                const $n: usize = 8;
                $body
            }
        }
    };
}

impl KeySize {
    pub const fn try_from_bytes(num_bytes: usize) -> Option<Self> {
        Some(match num_bytes {
            1 => KeySize::One,
            2 => KeySize::Two,
            3 => KeySize::Three,
            4 => KeySize::Four,
            5 => KeySize::Five,
            6 => KeySize::Six,
            7 => KeySize::Seven,
            8 => KeySize::Eight,
            _ => return None,
        })
    }

    pub const fn num_bytes(self) -> usize {
        self as usize
    }

    /// Copy every value in `column` into the key codes at `offset`.
    fn pack_column(self, column: &NativeColumnVector, offset: usize, key_codes: &mut [KeyCodeBytes]) {
        with_key_size!(self, N => pack_fixed::<N>(column, offset, key_codes))
    }

    /// Append the bytes at `offset` of every key code to `column`.
    fn unpack_column(
        self,
        key_codes: &[KeyCodeBytes],
        offset: usize,
        column: &mut NativeColumnVector,
    ) -> Result<()> {
        with_key_size!(self, N => unpack_fixed::<N>(key_codes, offset, column))
    }
}

fn pack_fixed<const N: usize>(
    column: &NativeColumnVector,
    offset: usize,
    key_codes: &mut [KeyCodeBytes],
) {
    debug_assert_eq!(N, column.width());
    debug_assert!(offset + N <= KEY_CODE_BYTES);
    for (code, value) in key_codes.iter_mut().zip(column.iter_untyped()) {
        code[offset..offset + N].copy_from_slice(&value[..N]);
    }
}

fn unpack_fixed<const N: usize>(
    key_codes: &[KeyCodeBytes],
    offset: usize,
    column: &mut NativeColumnVector,
) -> Result<()> {
    for code in key_codes {
        column.append_untyped(&code[offset..offset + N])?;
    }
    Ok(())
}

/// Hash table for grouping on small fixed width composite keys.
///
/// Every key column is copied into a single 8 byte key code, so hashing and
/// comparing keys is a single integer operation. Keys are stored in a key
/// bucket array, with collisions resolved through per-slot chains of buckets.
///
/// Only keys are stored, aggregates are not supported.
///
/// Upserts are lock free and may happen concurrently from many threads.
/// Finalization must only start once all upserts have completed.
#[derive(Debug)]
pub struct CompactKeySeparateChainingHashTable {
    key_types: Vec<KeyType>,
    key_sizes: Vec<KeySize>,
    /// Byte offset of each key column within a key code.
    key_offsets: Vec<usize>,
    /// Head of each chain, `bucket_index + 1` or zero if empty.
    slots: Box<[AtomicU32]>,
    key_buckets: Box<[KeyBucket]>,
    buckets_allocated: AtomicUsize,
    slots_init_splitter: RangeSplitter,
    key_buckets_init_splitter: RangeSplitter,
    /// Finalization splitter along with the key count it was built for.
    final_splitter: Mutex<Option<(usize, RangeSplitter)>>,
    config: HashTableConfig,
    _reservation: Reservation,
}

impl CompactKeySeparateChainingHashTable {
    /// Create a new table for the given key types.
    ///
    /// `num_entries` is an upper bound on the number of distinct keys that
    /// will be inserted.
    pub fn new(
        key_types: &[KeyType],
        num_entries: usize,
        handles: &[AggregationHandle],
        memory: &MemoryTracker,
        config: &HashTableConfig,
    ) -> Result<Self> {
        config.validate()?;

        if !handles.is_empty() {
            not_implemented!("Aggregation handles in compact key hash table");
        }
        if key_types.is_empty() {
            return Err(DbError::new("Compact key hash table requires at least one key"));
        }

        let mut key_sizes = Vec::with_capacity(key_types.len());
        let mut key_offsets = Vec::with_capacity(key_types.len());
        let mut total_key_size = 0;

        for key_type in key_types {
            if key_type.is_nullable() {
                return Err(DbError::new("Compact key hash table does not support nullable keys")
                    .with_field("type", key_type));
            }
            if key_type.is_variable_length() {
                return Err(DbError::new(
                    "Compact key hash table does not support variable length keys",
                )
                .with_field("type", key_type));
            }
            let num_bytes = key_type.maximum_byte_length();
            let key_size = KeySize::try_from_bytes(num_bytes).ok_or_else(|| {
                DbError::new("Unsupported key size")
                    .with_field("type", key_type)
                    .with_field("num_bytes", num_bytes)
            })?;

            key_offsets.push(total_key_size);
            key_sizes.push(key_size);
            total_key_size += num_bytes;
        }

        if total_key_size > KEY_CODE_BYTES {
            return Err(DbError::new("Total key size exceeds key code capacity")
                .with_field("total_key_size", total_key_size)
                .with_field("capacity", KEY_CODE_BYTES));
        }

        let num_slots =
            next_prime((num_entries as f64 * config.load_factor).ceil() as u64) as usize;
        let num_key_buckets = ((num_slots as f64 / config.load_factor) as usize).max(1);
        if num_key_buckets > MAX_KEY_BUCKETS {
            return Err(DbError::new("Too many entries for compact key hash table")
                .with_field("num_entries", num_entries));
        }

        let memory_bytes = SLOT_DATA_SIZE * num_slots + KEY_BUCKET_DATA_SIZE * num_key_buckets;
        let reservation = memory.try_reserve(memory_bytes)?;

        let slots = (0..num_slots).map(|_| AtomicU32::new(0)).collect();
        let key_buckets = (0..num_key_buckets).map(|_| KeyBucket::zeroed()).collect();

        let num_init_partitions =
            (memory_bytes / config.init_block_size).clamp(1, config.max_init_partitions);
        let slots_init_splitter = RangeSplitter::create_with_partition_length(
            0,
            num_slots,
            config.init_min_partition_length,
            num_init_partitions,
        )?;
        let key_buckets_init_splitter = RangeSplitter::create_with_partition_length(
            0,
            num_key_buckets,
            config.init_min_partition_length,
            num_init_partitions,
        )?;

        debug!(
            num_entries,
            num_slots,
            num_key_buckets,
            total_key_size,
            memory_bytes,
            num_init_partitions = slots_init_splitter
                .num_partitions()
                .max(key_buckets_init_splitter.num_partitions()),
            "created compact key hash table"
        );

        Ok(CompactKeySeparateChainingHashTable {
            key_types: key_types.to_vec(),
            key_sizes,
            key_offsets,
            slots,
            key_buckets,
            buckets_allocated: AtomicUsize::new(0),
            slots_init_splitter,
            key_buckets_init_splitter,
            final_splitter: Mutex::new(None),
            config: config.clone(),
            _reservation: reservation,
        })
    }

    pub fn key_types(&self) -> &[KeyType] {
        &self.key_types
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn num_key_buckets(&self) -> usize {
        self.key_buckets.len()
    }

    /// Number of distinct keys inserted so far.
    pub fn num_keys(&self) -> usize {
        self.buckets_allocated
            .load(Ordering::Relaxed)
            .min(self.key_buckets.len())
    }

    pub fn memory_consumption_bytes(&self) -> usize {
        SLOT_DATA_SIZE * self.slots.len() + KEY_BUCKET_DATA_SIZE * self.key_buckets.len()
    }

    pub fn num_initialization_partitions(&self) -> usize {
        self.slots_init_splitter
            .num_partitions()
            .max(self.key_buckets_init_splitter.num_partitions())
    }

    /// Clear a partition of the slot and bucket arrays so the table can be
    /// reused.
    ///
    /// A newly created table is already empty. Clearing resets the key count,
    /// and every partition must be cleared before upserting again.
    /// Partitions are disjoint and may be cleared from different threads, but
    /// never concurrently with upserts or finalization.
    pub fn initialize(&self, partition: usize) -> Result<()> {
        if partition >= self.num_initialization_partitions() {
            return Err(DbError::new("Initialization partition out of range")
                .with_field("partition", partition)
                .with_field("num_partitions", self.num_initialization_partitions()));
        }

        if partition < self.slots_init_splitter.num_partitions() {
            let range = self.slots_init_splitter.partition(partition)?;
            for slot in &self.slots[range] {
                slot.store(0, Ordering::Relaxed);
            }
        }

        if partition < self.key_buckets_init_splitter.num_partitions() {
            let range = self.key_buckets_init_splitter.partition(partition)?;
            for bucket in &self.key_buckets[range] {
                bucket.key_code.store(0, Ordering::Relaxed);
                bucket.next.store(0, Ordering::Relaxed);
            }
        }

        self.buckets_allocated.store(0, Ordering::Relaxed);
        *self.final_splitter.lock() = None;

        Ok(())
    }

    /// Insert the keys for a batch of tuples if they don't already exist.
    ///
    /// `argument_ids` are aggregate arguments and must all be empty since the
    /// table only holds keys.
    pub fn upsert_value_accessor_composite_key(
        &self,
        argument_ids: &[Vec<MultiSourceAttributeId>],
        key_attr_ids: &[MultiSourceAttributeId],
        accessor_mux: &ValueAccessorMultiplexer,
    ) -> Result<()> {
        if argument_ids.iter().any(|args| !args.is_empty()) {
            not_implemented!("Aggregate arguments in compact key hash table");
        }
        if key_attr_ids.len() != self.key_types.len() {
            return Err(DbError::new("Unexpected number of key attributes")
                .with_field("expected", self.key_types.len())
                .with_field("got", key_attr_ids.len()));
        }

        let mut key_codes: Vec<KeyCodeBytes> = Vec::new();

        for (idx, attr) in key_attr_ids.iter().enumerate() {
            let column = accessor_mux.column(*attr)?.try_as_native()?;
            if column.key_type() != self.key_types[idx] {
                return Err(DbError::new("Key column type mismatch")
                    .with_field("key", idx)
                    .with_field("expected", self.key_types[idx])
                    .with_field("got", column.key_type()));
            }

            if idx == 0 {
                key_codes = vec![[0; KEY_CODE_BYTES]; column.len()];
            } else if column.len() != key_codes.len() {
                return Err(DbError::new("Key columns have different lengths")
                    .with_field("expected", key_codes.len())
                    .with_field("got", column.len()));
            }

            self.key_sizes[idx].pack_column(column, self.key_offsets[idx], &mut key_codes);
        }

        for code in key_codes {
            self.locate_bucket(KeyCode::from_le_bytes(code))?;
        }

        Ok(())
    }

    /// Number of partitions used for finalization, computed from the number of
    /// keys currently in the table.
    pub fn num_finalization_partitions(&self) -> Result<usize> {
        Ok(self.final_splitter()?.num_partitions())
    }

    /// Write out the keys in a finalization partition, one column per key.
    pub fn finalize_keys(
        &self,
        partition: usize,
        output: &mut ColumnVectorsValueAccessor,
    ) -> Result<()> {
        let range = self.final_splitter()?.partition(partition)?;
        let key_codes: Vec<KeyCodeBytes> = self.key_buckets[range]
            .iter()
            .map(|bucket| bucket.key_code.load(Ordering::Relaxed).to_le_bytes())
            .collect();

        for (idx, key_type) in self.key_types.iter().enumerate() {
            let mut column = NativeColumnVector::new(*key_type, key_codes.len())?;
            self.key_sizes[idx].unpack_column(&key_codes, self.key_offsets[idx], &mut column)?;
            output.add_column(column)?;
        }

        Ok(())
    }

    fn final_splitter(&self) -> Result<RangeSplitter> {
        let num_keys = self.num_keys();
        let mut splitter = self.final_splitter.lock();
        if let Some((splitter_keys, splitter)) = splitter.as_ref() {
            if *splitter_keys == num_keys {
                return Ok(splitter.clone());
            }
        }

        let created = RangeSplitter::create_with_partition_length(
            0,
            num_keys,
            self.config.final_min_partition_length,
            self.config.num_workers * 2,
        )?;
        *splitter = Some((num_keys, created.clone()));

        Ok(created)
    }

    /// Find the bucket holding `key_code`, allocating one if the key doesn't
    /// exist yet.
    fn locate_bucket(&self, key_code: KeyCode) -> Result<BucketIndex> {
        let slot_idx = (key_code % self.slots.len() as u64) as usize;
        let mut pending_chain = &self.slots[slot_idx];

        loop {
            let mut existing_chain = match pending_chain.compare_exchange(
                0,
                EXCLUSIVE_STATE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // End of chain, we own it until a bucket is linked in.
                    let bucket_index = self.buckets_allocated.fetch_add(1, Ordering::Relaxed);
                    if bucket_index >= self.key_buckets.len() {
                        pending_chain.store(0, Ordering::Release);
                        return Err(DbError::new("Compact key hash table out of key buckets")
                            .with_field("num_key_buckets", self.key_buckets.len()));
                    }

                    self.key_buckets[bucket_index]
                        .key_code
                        .store(key_code, Ordering::Relaxed);
                    pending_chain.store(bucket_index as BucketIndex + 1, Ordering::Release);

                    return Ok(bucket_index as BucketIndex);
                }
                Err(existing) => existing,
            };

            while existing_chain == EXCLUSIVE_STATE {
                std::hint::spin_loop();
                existing_chain = pending_chain.load(Ordering::Acquire);
            }

            if existing_chain == 0 {
                // Allocation failed on another thread, try again.
                continue;
            }

            let bucket_index = existing_chain - 1;
            let bucket = &self.key_buckets[bucket_index as usize];
            if bucket.key_code.load(Ordering::Relaxed) == key_code {
                return Ok(bucket_index);
            }
            pending_chain = &bucket.next;
        }
    }
}
