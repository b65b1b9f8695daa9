// Ciphertext store benchmarks.
//
// Covers input encryption, homomorphic add (commitment reuse path), the
// compare + select pair every transfer performs, attested resolution, and
// re-encryption to a user key.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use cloak_protocol::crypto::{CloakKeypair, NetworkKey, ReencryptionKey};
use cloak_protocol::oracle::{RequestId, TrustedResponder};
use cloak_protocol::{Address, CiphertextStore};

fn fresh_store() -> (CiphertextStore, NetworkKey) {
    let key = NetworkKey::generate();
    (CiphertextStore::new(key.clone()), key)
}

fn bench_encrypt(c: &mut Criterion) {
    let (mut store, _) = fresh_store();
    c.bench_function("store/encrypt_u64", |b| {
        b.iter(|| store.encrypt(1_000_000).unwrap());
    });
}

fn bench_add(c: &mut Criterion) {
    let (mut store, _) = fresh_store();
    let a = store.encrypt(300).unwrap();
    let d = store.encrypt(700).unwrap();
    c.bench_function("store/add", |b| {
        b.iter(|| store.add(a, d).unwrap());
    });
}

fn bench_guarded_transfer_amount(c: &mut Criterion) {
    let (mut store, _) = fresh_store();
    let balance = store.encrypt(10_000).unwrap();
    let amount = store.encrypt(2_500).unwrap();
    let zero = store.encrypt(0).unwrap();
    c.bench_function("store/le_then_select", |b| {
        b.iter(|| {
            let ok = store.le(amount, balance).unwrap();
            store.select(ok, amount, zero).unwrap()
        });
    });
}

fn bench_respond(c: &mut Criterion) {
    let (mut store, key) = fresh_store();
    let responder = TrustedResponder::new(CloakKeypair::generate(), key);
    let h = store.encrypt(42).unwrap().handle();
    c.bench_function("oracle/respond", |b| {
        b.iter(|| {
            responder
                .respond(&store, RequestId::from_bytes([1u8; 32]), h)
                .unwrap()
        });
    });
}

fn bench_reencrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/reencrypt");
    let (mut store, _) = fresh_store();
    let alice = Address::derive("alice");
    let user = ReencryptionKey::generate();

    for count in [1usize, 10, 50] {
        let handles: Vec<_> = (0..count)
            .map(|i| {
                let h = store.encrypt(i as u64).unwrap();
                store.allow(h, alice).unwrap();
                h.handle()
            })
            .collect();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &handles, |b, handles| {
            b.iter(|| {
                for h in handles {
                    store.reencrypt(*h, &alice, &user.public_key()).unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encrypt,
    bench_add,
    bench_guarded_transfer_amount,
    bench_respond,
    bench_reencrypt,
);
criterion_main!(benches);
