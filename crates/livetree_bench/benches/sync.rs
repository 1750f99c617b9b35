//! End-to-end client benchmarks over the loopback server.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use livetree_bench::random_scores;
use livetree_client::{EventType, Value};
use livetree_testkit::{LoopbackLink, LoopbackServer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn bench_write_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync");

    group.bench_function("set_with_value_listener", |b| {
        let server = LoopbackServer::shared();
        let mut link = LoopbackLink::connect(Arc::clone(&server));
        let counter = link.database().reference("counter").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        counter.on(EventType::Value, move |_, _| {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        link.pump();
        let mut n = 0i64;
        b.iter(|| {
            n += 1;
            let _done = counter.set(n);
            link.pump();
        });
        black_box(fired.load(Ordering::Relaxed));
    });

    group.bench_function("fan_out_to_two_clients", |b| {
        let server = LoopbackServer::shared();
        let mut writer = LoopbackLink::connect(Arc::clone(&server));
        let mut reader = LoopbackLink::connect(Arc::clone(&server));
        reader
            .database()
            .reference("room")
            .unwrap()
            .on(EventType::ChildChanged, |snapshot, _| {
                black_box(snapshot.value());
            });
        reader.pump();
        let room = writer.database().reference("room/topic").unwrap();
        let mut n = 0i64;
        b.iter(|| {
            n += 1;
            let _done = room.set(n);
            writer.pump();
            reader.pump();
        });
    });

    group.finish();
}

fn bench_limited_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    group.bench_function("limit_to_last_10_of_500", |b| {
        let server = LoopbackServer::shared();
        server.set("scores", random_scores(500)).unwrap();
        let mut link = LoopbackLink::connect(Arc::clone(&server));
        let scores = link.database().reference("scores").unwrap();
        let top = scores.order_by_value().unwrap().limit_to_last(10).unwrap();
        top.on(EventType::ChildAdded, |_, _| {});
        top.on(EventType::ChildRemoved, |_, _| {});
        link.pump();
        let mut n = 1_000i64;
        b.iter(|| {
            n += 1;
            let _done = scores.child("item_0").unwrap().set(Value::from(n));
            link.pump();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_write_round_trip, bench_limited_query);
criterion_main!(benches);
