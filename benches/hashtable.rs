use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ringrep::core::{hash_key, DependencyChecker, LockFreeHashTable};

fn bench_murmur(c: &mut Criterion) {
    let mut group = c.benchmark_group("murmur3_32");
    for len in [8usize, 32, 256] {
        let key = vec![0x5au8; len];
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &key, |b, key| {
            b.iter(|| black_box(hash_key(black_box(key))))
        });
    }
    group.finish();
}

fn bench_insert_delete(c: &mut Criterion) {
    let checker = DependencyChecker::new(1024, 1, 1);
    let node = checker.node_for(0, 0);

    c.bench_function("checker_insert_release", |b| {
        let mut key = 0u32;
        b.iter(|| {
            key = key.wrapping_add(1);
            black_box(checker.try_insert(node, black_box(key)));
            checker.release(&[node]);
        })
    });
}

fn bench_switch(c: &mut Criterion) {
    let checker = DependencyChecker::new(1024, 2, 1);
    let nodes = [checker.node_for(0, 0), checker.node_for(1, 0)];
    checker.try_insert(nodes[0], 7);

    c.bench_function("checker_switch_same_key", |b| {
        let mut turn = 1;
        b.iter(|| {
            // The node switched out last round is unlinked before it is reused.
            checker.release(&[nodes[turn]]);
            black_box(checker.try_insert(nodes[turn], 7));
            turn ^= 1;
        })
    });
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_search");
    for per_bucket in [1u32, 8, 32] {
        let buckets = 64;
        let table = LockFreeHashTable::new(buckets, buckets * per_bucket);
        for i in 0..buckets * per_bucket {
            let node = table.entry(i);
            let key = i + 1;
            table.prepare(node, key);
            let at = table.search(key);
            table.insert(node, at);
        }
        group.bench_with_input(BenchmarkId::from_parameter(per_bucket), &table, |b, table| {
            let mut key = 0u32;
            b.iter(|| {
                key = (key + 1) % (buckets * per_bucket);
                // Only misses; a hit would leave the match protected.
                black_box(table.search(black_box(key + buckets * per_bucket + 1)))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_murmur, bench_insert_delete, bench_switch, bench_search);
criterion_main!(benches);
