use std::collections::HashMap;
use std::hint::black_box;

use codesync_collab::broadcast::ProjectRoom;
use codesync_collab::cursor::{compute_decorations, CursorState};
use codesync_collab::presence::{ColorHint, Participant, PresenceAction, PresenceDirectory};
use codesync_collab::protocol::{
    Envelope, EnvelopeCodec, FileId, ParticipantId, ParticipantInfo, Payload, ProjectId,
    SessionIdentity,
};
use criterion::{criterion_group, criterion_main, Criterion};
use uuid::Uuid;

fn cursor_payload() -> Payload {
    Payload::CursorPosition {
        file_id: FileId::from("src/main.rs"),
        line: 120,
        column: 17,
    }
}

fn bench_envelope_encode(c: &mut Criterion) {
    let mut codec = EnvelopeCodec::new(SessionIdentity::new("42", "7", "Ada"));

    c.bench_function("cursor_envelope_encode", |b| {
        b.iter(|| {
            black_box(codec.encode(black_box(cursor_payload())).unwrap());
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let mut codec = EnvelopeCodec::new(SessionIdentity::new("42", "7", "Ada"));
    let frame = codec.encode(cursor_payload()).unwrap();

    c.bench_function("cursor_envelope_decode", |b| {
        b.iter(|| {
            black_box(Envelope::decode(black_box(&frame)).unwrap());
        })
    });
}

fn bench_code_change_decode_4kb(c: &mut Criterion) {
    let mut codec = EnvelopeCodec::new(SessionIdentity::new("42", "7", "Ada"));
    let frame = codec
        .encode(Payload::CodeChange {
            file_id: FileId::from("src/main.rs"),
            content: "fn main() {}\n".repeat(315),
        })
        .unwrap();

    c.bench_function("code_change_decode_4KB", |b| {
        b.iter(|| {
            black_box(Envelope::decode(black_box(&frame)).unwrap());
        })
    });
}

fn bench_color_hint(c: &mut Criterion) {
    let id = ParticipantId::from("3f2b9c1e-5d1a-4c3b-9a8e-1b2c3d4e5f60");

    c.bench_function("color_hint_for_participant", |b| {
        b.iter(|| {
            black_box(ColorHint::for_participant(black_box(&id)));
        })
    });
}

fn bench_decorations_100_cursors(c: &mut Criterion) {
    let file = FileId::from("src/main.rs");
    let cursors: HashMap<ParticipantId, CursorState> = (0..100)
        .map(|i| {
            let id = ParticipantId::from(format!("user-{i}"));
            let state = CursorState {
                participant_id: id.clone(),
                display_name: format!("User {i}"),
                file_id: if i % 4 == 0 { FileId::from("other.rs") } else { file.clone() },
                line: i + 1,
                column: 5,
                updated_at: 1,
            };
            (id, state)
        })
        .collect();
    let local = ParticipantId::from("user-1");

    c.bench_function("compute_decorations_100", |b| {
        b.iter(|| {
            black_box(compute_decorations(black_box(&cursors), Some(&file), &local));
        })
    });
}

fn bench_roster_snapshot_100(c: &mut Criterion) {
    let mut directory = PresenceDirectory::new(&SessionIdentity::new("42", "me", "Me"));
    let roster = (0..100)
        .map(|i| Participant::new(ParticipantId::from(format!("user-{i}")), format!("User {i}")))
        .collect();
    directory.apply(PresenceAction::ReplaceRoster(roster)).unwrap();

    c.bench_function("roster_snapshot_100", |b| {
        b.iter(|| {
            black_box(directory.snapshot());
        })
    });
}

fn bench_room_relay_100_members(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let room = ProjectRoom::new(ProjectId::from("42"), 1024);
    let origin = Uuid::new_v4();
    let receivers: Vec<_> = rt.block_on(async {
        let mut receivers = Vec::new();
        for i in 0..100 {
            let conn = if i == 0 { origin } else { Uuid::new_v4() };
            let info = ParticipantInfo::new(format!("user-{i}"), format!("User {i}"));
            receivers.push(room.join(conn, info, 0).await.unwrap());
        }
        receivers
    });

    c.bench_function("room_relay_100_members", |b| {
        b.iter(|| {
            black_box(room.relay(origin, black_box("{\"type\":\"user_typing\"}")));
        })
    });
    drop(receivers);
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_code_change_decode_4kb,
    bench_color_hint,
    bench_decorations_100_cursors,
    bench_roster_snapshot_100,
    bench_room_relay_100_members,
);
criterion_main!(benches);
