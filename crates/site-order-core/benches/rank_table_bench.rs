use criterion::{criterion_group, criterion_main, Criterion};
use site_order_core::{Rank, RankTable, RecordId};

fn mk_table(size: i64) -> (RankTable, Vec<RecordId>) {
    let ids = (1..=size).filter_map(RecordId::new).collect::<Vec<_>>();
    let table = ids.iter().copied().zip((0_u32..).map(Rank)).collect();
    (table, ids)
}

fn bench_reindex(c: &mut Criterion) {
    let (table, mut ids) = mk_table(1_000);
    ids.reverse();

    c.bench_function("rank_table_reindex_1000_reversed", |b| {
        b.iter(|| {
            let mut ranks = table.clone();
            match ranks.reindex(&ids) {
                Ok(changed) => changed.len(),
                Err(err) => panic!("reindex benchmark failed: {err}"),
            }
        });
    });
}

fn bench_compact(c: &mut Criterion) {
    let ids = (1..=1_000).filter_map(RecordId::new).collect::<Vec<_>>();
    let sparse: RankTable = ids.iter().copied().zip((0_u32..).step_by(3).map(Rank)).collect();

    c.bench_function("rank_table_compact_1000_sparse", |b| {
        b.iter(|| {
            let mut ranks = sparse.clone();
            ranks.compact().len()
        });
    });
}

criterion_group!(benches, bench_reindex, bench_compact);
criterion_main!(benches);
