use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quill_collab::awareness::{Awareness, AwarenessMessage, AwarenessUpdate, UpdateOrigin};
use quill_collab::identity::{CursorColor, PresenceState};
use quill_collab::presence::{reconcile, PeerEntry};
use quill_collab::protocol::PeerMessage;

fn presence(id: u64) -> PresenceState {
    PresenceState::new(
        format!("Peer {id}"),
        format!("https://randomuser.me/api/portraits/men/{}.jpg", id % 95),
        CursorColor::default(),
    )
}

fn room(peers: u64) -> (Vec<PeerEntry>, HashMap<u64, PresenceState>) {
    let current: HashMap<u64, PresenceState> = (0..peers).map(|id| (id, presence(id))).collect();
    let mut snapshot: Vec<PeerEntry> = current
        .iter()
        .map(|(id, presence)| PeerEntry { id: *id, presence: presence.clone() })
        .collect();
    snapshot.sort_by_key(|peer| peer.id);
    (snapshot, current)
}

fn bench_reconcile_single_update(c: &mut Criterion) {
    let (snapshot, current) = room(100);
    let change = AwarenessUpdate {
        added: Vec::new(),
        updated: vec![42],
        removed: Vec::new(),
        origin: UpdateOrigin::Remote,
    };

    c.bench_function("reconcile_1_of_100", |b| {
        b.iter(|| black_box(reconcile(black_box(&snapshot), &current, &change)))
    });
}

fn bench_reconcile_churn(c: &mut Criterion) {
    let (snapshot, current) = room(100);
    let change = AwarenessUpdate {
        added: (100..110).collect(),
        updated: (0..20).collect(),
        removed: (80..100).collect(),
        origin: UpdateOrigin::Remote,
    };

    c.bench_function("reconcile_churn_50_of_100", |b| {
        b.iter(|| black_box(reconcile(black_box(&snapshot), &current, &change)))
    });
}

fn bench_awareness_roundtrip(c: &mut Criterion) {
    let awareness = Awareness::new(1);
    awareness.set_local_state(Some(presence(1)));
    let message = awareness.local_message();

    c.bench_function("awareness_frame_roundtrip", |b| {
        b.iter(|| {
            let frame = PeerMessage::awareness(1, "doc", black_box(&message)).unwrap();
            let bytes = frame.encode().unwrap();
            let decoded = PeerMessage::decode(&bytes).unwrap();
            black_box(decoded.awareness_message().unwrap());
        })
    });
}

fn bench_apply_remote_awareness(c: &mut Criterion) {
    let remote = Awareness::new(2);
    remote.set_local_state(Some(presence(2)));
    let message: AwarenessMessage = remote.full_message();

    c.bench_function("awareness_apply_remote", |b| {
        b.iter(|| {
            let local = Awareness::new(1);
            local.apply_message(black_box(&message));
            black_box(local.get_states().len());
        })
    });
}

criterion_group!(
    benches,
    bench_reconcile_single_update,
    bench_reconcile_churn,
    bench_awareness_roundtrip,
    bench_apply_remote_awareness,
);
criterion_main!(benches);
