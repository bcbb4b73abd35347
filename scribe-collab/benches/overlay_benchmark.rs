use criterion::{black_box, criterion_group, criterion_main, Criterion};
use scribe_collab::overlay::StarNetwork;
use scribe_collab::pool::MemoryExchange;
use scribe_collab::protocol::{Envelope, NetworkId, PeerId};
use std::sync::Arc;

fn bench_envelope_encode(c: &mut Criterion) {
    let envelope = Envelope::direct(
        NetworkId::new("network-a"),
        PeerId::new("peer-1"),
        vec![0u8; 64],
    );

    c.bench_function("envelope_encode_64B", |b| {
        b.iter(|| {
            black_box(black_box(&envelope).encode().unwrap());
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let envelope = Envelope::relay_unicast(
        NetworkId::new("network-a"),
        PeerId::new("peer-2"),
        PeerId::new("peer-3"),
        vec![0u8; 64],
    );
    let encoded = envelope.encode().unwrap();

    c.bench_function("envelope_decode_64B", |b| {
        b.iter(|| {
            black_box(Envelope::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_hub_broadcast_fan_out(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    // Hub plus 32 connected spokes on one in-process exchange.
    let (hub, _spokes) = runtime.block_on(async {
        let exchange = MemoryExchange::new();
        let hub_pool = Arc::new(exchange.register("hub"));
        let hub = StarNetwork::hub("bench-network", hub_pool);

        let mut spokes = Vec::new();
        for i in 0..32 {
            let pool = Arc::new(exchange.register(format!("spoke-{i}")));
            let spoke = StarNetwork::spoke("bench-network", pool);
            spoke.connect_to("hub").await.unwrap();
            spokes.push(spoke);
        }
        // Let the join envelopes land.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hub.members().len(), 32);
        (hub, spokes)
    });

    c.bench_function("hub_broadcast_64B_32_members", |b| {
        let payload = vec![0u8; 64];
        b.iter(|| {
            hub.broadcast(black_box(payload.clone()));
        })
    });

    drop(runtime);
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_hub_broadcast_fan_out
);
criterion_main!(benches);
