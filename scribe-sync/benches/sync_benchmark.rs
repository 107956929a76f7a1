use criterion::{black_box, criterion_group, criterion_main, Criterion};
use scribe_sync::awareness::{AwarenessState, AwarenessStore, CursorRange, UserProfile};
use scribe_sync::engine::Origin;
use scribe_sync::protocol::{ClientId, WireMessage};
use scribe_sync::{DocumentContent, ReplicatedDocument, TextEngine};

fn typing_deltas(n: usize) -> Vec<Vec<u8>> {
    let mut engine = TextEngine::new();
    for i in 0..n {
        engine.push_text(if i % 40 == 39 { "\n" } else { "a" }).unwrap();
    }
    engine.take_updates().into_iter().map(|u| u.delta).collect()
}

fn bench_delta_apply(c: &mut Criterion) {
    let deltas = typing_deltas(500);

    c.bench_function("apply_500_keystroke_deltas", |b| {
        b.iter(|| {
            let mut engine = TextEngine::new();
            for delta in &deltas {
                engine.apply_delta(black_box(delta), Origin::Remote).unwrap();
            }
            black_box(engine.take_updates().len());
        })
    });
}

fn bench_full_state(c: &mut Criterion) {
    let mut engine = TextEngine::new();
    for delta in typing_deltas(2_000) {
        engine.apply_delta(&delta, Origin::Remote).unwrap();
    }
    let state = engine.encode_state();

    c.bench_function("encode_state_2000_chars", |b| {
        b.iter(|| black_box(engine.encode_state()))
    });

    c.bench_function("bootstrap_from_state_2000_chars", |b| {
        b.iter(|| {
            let mut fresh = TextEngine::new();
            fresh.apply_delta(black_box(&state), Origin::Remote).unwrap();
            black_box(fresh.len());
        })
    });
}

fn bench_envelope_roundtrip(c: &mut Criterion) {
    let sender = ClientId::random();
    let msg = WireMessage::delta(sender, vec![7u8; 64]);
    let envelope = msg.to_envelope().unwrap();

    c.bench_function("delta_to_envelope_64B", |b| {
        b.iter(|| black_box(msg.to_envelope().unwrap()))
    });

    c.bench_function("delta_from_envelope_64B", |b| {
        b.iter(|| black_box(WireMessage::from_envelope(black_box(&envelope)).unwrap()))
    });
}

fn bench_awareness(c: &mut Criterion) {
    let mut store = AwarenessStore::new(ClientId::random());
    store.set_local_state(AwarenessState {
        user: UserProfile::named("BrightPanda42"),
        cursor: Some(CursorRange { anchor: 10, head: 24 }),
    });
    let local = store.local_id();
    let update = store.encode_update(&[local]).unwrap();

    c.bench_function("awareness_encode", |b| {
        b.iter(|| black_box(store.encode_update(&[local]).unwrap()))
    });

    c.bench_function("awareness_apply", |b| {
        b.iter(|| {
            let mut remote = AwarenessStore::new(ClientId::random());
            black_box(remote.apply_update(black_box(&update), Origin::Remote).unwrap());
        })
    });
}

fn bench_content_parse(c: &mut Criterion) {
    let text = "lorem ipsum dolor sit amet\n".repeat(200);
    let stored = DocumentContent::from_text(&text).to_json();

    c.bench_function("content_from_stored_200_paragraphs", |b| {
        b.iter(|| black_box(DocumentContent::from_stored(Some(black_box(&stored)))))
    });
}

criterion_group!(
    benches,
    bench_delta_apply,
    bench_full_state,
    bench_envelope_roundtrip,
    bench_awareness,
    bench_content_parse,
);
criterion_main!(benches);
