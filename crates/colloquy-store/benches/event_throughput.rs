use std::env;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use colloquy_store::{EventStore, ReplayEngine, StoreConfig};
use colloquy_types::{
    ConversationStart, Event, EventKind, MessageComplete, TurnComplete, TurnMessage, TurnRecord,
    AGENT_A, AGENT_B,
};
use criterion::measurement::WallTime;
use criterion::{criterion_group, criterion_main, BenchmarkGroup, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CONVERSATION_ID: &str = "bench-conversation";
const EXPERIMENT_ID: &str = "bench-experiment";

fn synthetic_turns(turns: usize, seed: u64) -> Vec<Event> {
    let mut rng = StdRng::seed_from_u64(seed);
    let start = Utc::now();
    let mut events = Vec::with_capacity(turns * 3 + 1);
    let push = |events: &mut Vec<Event>, kind: EventKind| {
        let sequence = events.len() as i64 + 1;
        events.push(Event {
            event_id: format!("e{sequence}"),
            timestamp: start + ChronoDuration::milliseconds(sequence),
            conversation_id: Some(CONVERSATION_ID.to_string()),
            experiment_id: Some(EXPERIMENT_ID.to_string()),
            sequence,
            kind,
        });
    };

    push(
        &mut events,
        EventKind::ConversationStart(ConversationStart {
            agent_a_id: AGENT_A.to_string(),
            agent_b_id: AGENT_B.to_string(),
            agent_a_model: "model-a".to_string(),
            agent_b_model: "model-b".to_string(),
            agent_a_temperature: Some(0.7),
            agent_b_temperature: Some(0.7),
            initial_prompt: Some("bench".to_string()),
            max_turns: Some(turns as u32),
        }),
    );
    for turn in 1..=turns as u32 {
        for agent in [AGENT_A, AGENT_B] {
            push(
                &mut events,
                EventKind::MessageComplete(MessageComplete {
                    agent_id: agent.to_string(),
                    turn_number: Some(turn),
                    tokens: rng.gen_range(10..400),
                }),
            );
        }
        let words = rng.gen_range(5..60);
        push(
            &mut events,
            EventKind::TurnComplete(TurnComplete {
                turn_number: turn,
                turn: TurnRecord {
                    agent_a_message: Some(TurnMessage {
                        content: "word ".repeat(words),
                        ..TurnMessage::default()
                    }),
                    agent_b_message: Some(TurnMessage {
                        content: "reply ".repeat(words),
                        ..TurnMessage::default()
                    }),
                },
                convergence_score: Some(rng.gen_range(0.0..1.0)),
            }),
        );
    }
    events
}

fn bench_append(group: &mut BenchmarkGroup<'_, WallTime>, count: usize) {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::new(dir.path().join("bench.db")).with_batch_size(batch_size());
    let store = EventStore::open(config).unwrap();
    let events = synthetic_turns(count / 3, 7);

    group.bench_with_input(BenchmarkId::new("append_flush", count), &count, |b, _| {
        b.iter(|| {
            for event in &events {
                store
                    .append_event(event.kind.clone(), Some(CONVERSATION_ID), Some(EXPERIMENT_ID))
                    .unwrap();
            }
            store.flush().unwrap();
        })
    });
    store.close().unwrap();
}

fn bench_replay(group: &mut BenchmarkGroup<'_, WallTime>, count: usize) {
    let events = synthetic_turns(count / 3, 11);
    group.bench_with_input(BenchmarkId::new("replay", count), &count, |b, _| {
        b.iter(|| {
            let state = ReplayEngine::replay(&events);
            assert_eq!(state.events_applied, events.len());
        })
    });
}

fn event_throughput_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_throughput");
    group.sample_size(20);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(5));

    let mut sizes = vec![300, 3_000, 30_000];
    if is_extended() {
        sizes.push(300_000);
    }
    for count in sizes {
        bench_append(&mut group, count);
        bench_replay(&mut group, count);
    }
    group.finish();
}

fn is_extended() -> bool {
    matches!(
        env::var("COLLOQUY_BENCH_EXTENDED").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE")
    )
}

fn batch_size() -> usize {
    if let Ok(value) = env::var("COLLOQUY_BENCH_BATCH_SIZE") {
        if let Ok(parsed) = value.parse::<usize>() {
            return parsed.max(1);
        }
    }
    500
}

criterion_group!(benches, event_throughput_bench);
criterion_main!(benches);
