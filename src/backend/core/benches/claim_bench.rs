//! Benchmarks for scheduling and claiming against the in-memory store.
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tickq_core::config::QueueConfig;
use tickq_core::queue::{EntryKey, JobId, ScheduleRequest, ScheduledQueue};

fn bench_entry_key_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("entry_key_codec");
    let key = EntryKey::new(JobId(123_456), Some("owner-42".into()), Some("mail".into()));
    let encoded = key.encode().unwrap();
    group.bench_function("encode", |b| { b.iter(|| black_box(key.encode().unwrap())); });
    group.bench_function("decode", |b| { b.iter(|| black_box(EntryKey::decode(&encoded).unwrap())); });
    group.finish();
}

fn bench_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for owners in [1usize, 16, 256] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(owners), &owners, |b, &owners| {
            let queue = ScheduledQueue::in_memory(QueueConfig::default()).unwrap();
            let mut n = 0usize;
            b.iter(|| {
                n += 1;
                let request = ScheduleRequest::new(b"payload".to_vec(), Utc::now()).with_owner(format!("{}", n % owners));
                rt.block_on(async { black_box(queue.schedule(request).await.unwrap()); });
            });
        });
    }
    group.finish();
}

fn bench_schedule_claim_ack(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_claim_ack");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for backlog in [0usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            let queue = ScheduledQueue::in_memory(QueueConfig::default()).unwrap();
            let later = Utc::now() + chrono::Duration::hours(1);
            rt.block_on(async {
                for _ in 0..backlog {
                    queue.schedule(ScheduleRequest::new(b"future".to_vec(), later).with_type("bg")).await.unwrap();
                }
            });
            b.iter(|| {
                rt.block_on(async {
                    queue.schedule(ScheduleRequest::new(b"now".to_vec(), Utc::now()).with_owner("1")).await.unwrap();
                    let claim = queue.claim(Some("bench")).await.unwrap().unwrap();
                    black_box(queue.acknowledge(claim.descriptor()).await.unwrap());
                });
            });
        });
    }
    group.finish();
}

fn bench_pagination(c: &mut Criterion) {
    let mut group = c.benchmark_group("pagination_scan");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for page_size in [10usize, 100] {
        let queue = ScheduledQueue::in_memory(QueueConfig::default().with_page_size(page_size)).unwrap();
        rt.block_on(async {
            for i in 0..1_000i64 {
                queue.schedule(ScheduleRequest::new(b"x".to_vec(), Utc::now() + chrono::Duration::seconds(i))).await.unwrap();
            }
        });
        group.throughput(Throughput::Elements(1_000));
        group.bench_with_input(BenchmarkId::from_parameter(page_size), &page_size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let mut items = queue.items();
                    let mut count = 0usize;
                    while let Some(item) = items.next().await.unwrap() {
                        count += black_box(item.payload.len());
                    }
                    black_box(count)
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_entry_key_codec, bench_schedule, bench_schedule_claim_ack, bench_pagination);
criterion_main!(benches);
