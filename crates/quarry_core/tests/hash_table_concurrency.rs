use std::thread;

use hashbrown::HashSet;
use quarry_core::config::storage::HashTableConfig;
use quarry_core::storage::column_vector::NativeColumnVector;
use quarry_core::storage::compact_key_hash_table::CompactKeySeparateChainingHashTable;
use quarry_core::storage::memory::MemoryTracker;
use quarry_core::storage::types::{KeyType, KeyTypeId};
use quarry_core::storage::value_accessor::{
    ColumnVectorsValueAccessor,
    MultiSourceAttributeId,
    ValueAccessorMultiplexer,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

const KEYS: [MultiSourceAttributeId; 2] = [
    MultiSourceAttributeId::base(0),
    MultiSourceAttributeId::base(1),
];

fn int32() -> KeyType {
    KeyType::new(KeyTypeId::Int32)
}

fn accessor_for(pairs: &[(i32, i32)]) -> ColumnVectorsValueAccessor {
    let mut accessor = ColumnVectorsValueAccessor::new();
    accessor
        .add_column(NativeColumnVector::from_values(int32(), pairs.iter().map(|p| p.0)).unwrap())
        .unwrap();
    accessor
        .add_column(NativeColumnVector::from_values(int32(), pairs.iter().map(|p| p.1)).unwrap())
        .unwrap();
    accessor
}

fn finalize_all(table: &CompactKeySeparateChainingHashTable) -> Vec<(i32, i32)> {
    let num_partitions = table.num_finalization_partitions().unwrap();
    (0..num_partitions)
        .into_par_iter()
        .map(|partition| {
            let mut output = ColumnVectorsValueAccessor::new();
            table.finalize_keys(partition, &mut output).unwrap();
            let left = output.column(0).unwrap().try_as_native().unwrap();
            let right = output.column(1).unwrap().try_as_native().unwrap();
            (0..output.num_tuples())
                .map(|row| {
                    (
                        left.value::<i32>(row).unwrap(),
                        right.value::<i32>(row).unwrap(),
                    )
                })
                .collect::<Vec<_>>()
        })
        .flatten()
        .collect()
}

#[test]
fn concurrent_upserts_produce_each_key_once() {
    logutil::init_test();

    let config = HashTableConfig {
        num_workers: 4,
        final_min_partition_length: 256,
        ..Default::default()
    };

    // Threads insert overlapping key ranges so many inserts race on the same
    // chains.
    let num_threads = 4;
    let per_thread = 2000;
    let batches: Vec<Vec<(i32, i32)>> = (0..num_threads)
        .map(|t| {
            let mut rng = ChaCha8Rng::seed_from_u64(t as u64);
            (0..per_thread)
                .map(|_| {
                    let k = rng.random_range(0..3000);
                    (k, k % 7)
                })
                .collect()
        })
        .collect();
    let expected: HashSet<(i32, i32)> = batches.iter().flatten().copied().collect();

    let table = CompactKeySeparateChainingHashTable::new(
        &[int32(), int32()],
        3000,
        &[],
        &MemoryTracker::unbounded(),
        &config,
    )
    .unwrap();

    thread::scope(|s| {
        for batch in &batches {
            let table = &table;
            s.spawn(move || {
                for chunk in batch.chunks(100) {
                    let accessor = accessor_for(chunk);
                    let mux = ValueAccessorMultiplexer::new(&accessor);
                    table
                        .upsert_value_accessor_composite_key(&[], &KEYS, &mux)
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(expected.len(), table.num_keys());

    let finalized = finalize_all(&table);
    let finalized_set: HashSet<_> = finalized.iter().copied().collect();
    assert_eq!(finalized.len(), finalized_set.len());
    assert_eq!(expected, finalized_set);
}

#[test]
fn parallel_initialization_then_build() {
    logutil::init_test();

    // Small partition sizes to get many initialization partitions.
    let config = HashTableConfig {
        num_workers: 4,
        init_block_size: 4096,
        init_min_partition_length: 128,
        max_init_partitions: 16,
        final_min_partition_length: 128,
        ..Default::default()
    };
    let table = CompactKeySeparateChainingHashTable::new(
        &[int32(), int32()],
        5000,
        &[],
        &MemoryTracker::unbounded(),
        &config,
    )
    .unwrap();
    assert_eq!(16, table.num_initialization_partitions());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(4)
        .thread_name(|idx| format!("hash-table-init-{idx}"))
        .build()
        .unwrap();

    pool.install(|| {
        (0..table.num_initialization_partitions())
            .into_par_iter()
            .try_for_each(|partition| table.initialize(partition))
    })
    .unwrap();
    table.initialize(16).unwrap_err();

    let pairs: Vec<(i32, i32)> = (0..5000).map(|i| (i / 10, i % 10)).collect();
    pool.install(|| {
        pairs.par_chunks(250).try_for_each(|chunk| {
            let accessor = accessor_for(chunk);
            let mux = ValueAccessorMultiplexer::new(&accessor);
            table.upsert_value_accessor_composite_key(&[], &KEYS, &mux)
        })
    })
    .unwrap();

    assert_eq!(5000, table.num_keys());
    let mut finalized = pool.install(|| finalize_all(&table));
    finalized.sort();
    assert_eq!(pairs, finalized);
}
