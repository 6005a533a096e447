use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use shareflow_session::broadcast::{Audience, BroadcastGroup};
use shareflow_session::protocol::{ClientEvent, ServerEvent, TextChange, TextUpdate};
use shareflow_session::room::{RoomRecord, RoomPolicy, TrustMode, UsageCounters};
use shareflow_session::secret::SecretHash;
use shareflow_session::storage::{DataStore, MemoryStore};
use uuid::Uuid;

fn text_update(len: usize) -> ServerEvent {
    ServerEvent::TextUpdate(TextUpdate {
        text_content: "x".repeat(len),
        language: "rust".into(),
        editor: "bench".into(),
        editor_id: Uuid::new_v4(),
        timestamp: 1_700_000_000_000,
    })
}

fn bench_text_update_encode(c: &mut Criterion) {
    let event = text_update(1024);
    c.bench_function("text_update_encode_1KB", |b| {
        b.iter(|| black_box(black_box(&event).encode().unwrap()))
    });
}

fn bench_text_change_decode(c: &mut Criterion) {
    let frame = ClientEvent::TextChange(TextChange {
        room_id: "0123456789abcdef".into(),
        text_content: "y".repeat(1024),
        language: Some("rust".into()),
    })
    .encode()
    .unwrap();
    c.bench_function("text_change_decode_1KB", |b| {
        b.iter(|| black_box(ClientEvent::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let group = BroadcastGroup::new(1024);
    let members: Vec<Uuid> = (0..20).map(|_| Uuid::new_v4()).collect();
    let mut receivers: Vec<_> = members.iter().map(|_| group.subscribe()).collect();
    let event = text_update(256);

    c.bench_function("fan_out_100_msgs_20_members", |b| {
        b.iter(|| {
            for _ in 0..100 {
                group.send(Audience::AllExcept(members[0]), &event).unwrap();
            }
            for (rx, conn) in receivers.iter_mut().zip(&members) {
                while let Ok(env) = rx.try_recv() {
                    black_box(env.audience.includes(*conn));
                }
            }
        })
    });
}

fn bench_secret_verify(c: &mut Criterion) {
    let hash = SecretHash::derive("abc123").unwrap();
    c.bench_function("secret_verify", |b| b.iter(|| black_box(hash.verify(black_box("abc123")))));
}

fn bench_memory_store_update(c: &mut Criterion) {
    let store = MemoryStore::new();
    let mut record = RoomRecord {
        id: "0123456789abcdef".into(),
        mode: TrustMode::Public,
        title: "bench".into(),
        text: String::new(),
        language: "plaintext".into(),
        secret: None,
        created_at: 0,
        expires_at: u64::MAX,
        files: Vec::new(),
        active_users: Vec::new(),
        policy: RoomPolicy::default(),
        counters: UsageCounters::default(),
        version: 0,
    };
    store.insert_room(&record).unwrap();

    c.bench_function("memory_store_update_room", |b| {
        b.iter(|| {
            record.counters.edits += 1;
            let expected = record.version;
            record.version = store.update_room(&record, expected).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_text_update_encode,
    bench_text_change_decode,
    bench_fan_out,
    bench_secret_verify,
    bench_memory_store_update,
);
criterion_main!(benches);
