use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use keelson_core::{AggregateId, StorageMode, Stream};
use keelson_engine::{
    domain_events, AggregateTypeDescription, CommandProcessorDescription, Engine, EngineBuilder,
    EngineStore, EventStore, FunctionalFlavour, InMemoryMultiModelStore, NewEvent, Repository,
};
use keelson_messaging::{meta, Message};

fn user_event_names() -> BTreeSet<String> {
    ["UserRegistered", "NameChanged"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn user_flavour() -> FunctionalFlavour {
    let mut flavour = FunctionalFlavour::new();
    flavour.register_apply_function("User", "UserRegistered", |_state, event| {
        json!({"id": event.get("id"), "name": event.get("name")})
    });
    flavour.register_apply_function("User", "NameChanged", |state, event| {
        let mut state = state.cloned().unwrap_or(json!({}));
        state["name"] = event.get("name").cloned().unwrap_or(JsonValue::Null);
        state
    });
    flavour.register_aggregate_factory("register_user", |command, _context| {
        Ok(domain_events(vec![NewEvent::new(
            "UserRegistered",
            command.payload().clone(),
        )]))
    });
    flavour.register_subsequent_function("change_name", |_state, command, _context| {
        Ok(domain_events(vec![NewEvent::new(
            "NameChanged",
            json!({"name": command.get("name").cloned().unwrap_or(JsonValue::Null)}),
        )]))
    });
    flavour
}

fn setup_engine(snapshots: bool) -> (Engine<FunctionalFlavour>, Arc<InMemoryMultiModelStore>) {
    let store = Arc::new(InMemoryMultiModelStore::new());
    let aggregate = if snapshots {
        AggregateTypeDescription::new("User", user_event_names()).with_snapshots("users_state")
    } else {
        AggregateTypeDescription::new("User", user_event_names())
    };

    let engine = EngineBuilder::new(user_flavour(), EngineStore::MultiModel(store.clone()))
        .describe_aggregate(aggregate)
        .process(CommandProcessorDescription::new_aggregate(
            "RegisterUser",
            "User",
            "id",
            "register_user",
        ))
        .process(CommandProcessorDescription::existing_aggregate(
            "ChangeName",
            "User",
            "id",
            "change_name",
        ))
        .build()
        .expect("engine builds");
    engine.bootstrap().expect("bootstrap succeeds");
    (engine, store)
}

fn register(engine: &Engine<FunctionalFlavour>, id: &str) {
    let command = Message::command("RegisterUser", json!({"id": id, "name": "Alice"})).unwrap();
    engine.dispatch(command).unwrap();
}

fn change(engine: &Engine<FunctionalFlavour>, id: &str, name: &str) {
    let command = Message::command("ChangeName", json!({"id": id, "name": name})).unwrap();
    engine.dispatch(command).unwrap();
}

fn bench_command_dispatch_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_dispatch");
    group.throughput(Throughput::Elements(1));

    group.bench_function("register_user", |b| {
        let mut n = 0u64;
        let (engine, _store) = setup_engine(true);
        b.iter(|| {
            n += 1;
            let id = format!("U{n}");
            register(black_box(&engine), &id);
        });
    });

    group.bench_function("change_name_on_short_history", |b| {
        let (engine, _store) = setup_engine(true);
        register(&engine, "U1");
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            change(black_box(&engine), "U1", &format!("Name{n}"));
        });
    });

    group.finish();
}

fn bench_replay_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_load");

    for history_len in [10u64, 100, 1_000] {
        // One aggregate with `history_len` events plus an up-to-date snapshot.
        let (engine, store) = setup_engine(true);
        register(&engine, "U1");
        for i in 1..history_len {
            change(&engine, "U1", &format!("Name{i}"));
        }
        drop(engine);

        let flavour = user_flavour();
        let engine_store = EngineStore::MultiModel(store.clone());
        let stream = Stream::of_write_model();
        let names = user_event_names();
        let id = AggregateId::new("U1").unwrap();

        group.throughput(Throughput::Elements(history_len));
        group.bench_with_input(
            BenchmarkId::new("pure_event_replay", history_len),
            &history_len,
            |b, _| {
                let repository = Repository::new(
                    &engine_store,
                    &stream,
                    "User",
                    &names,
                    StorageMode::Events,
                    None,
                );
                b.iter(|| {
                    let root = repository
                        .get_aggregate_root(&flavour, black_box(&id), None)
                        .unwrap()
                        .unwrap();
                    black_box(root.version())
                });
            },
        );
        group.bench_with_input(
            BenchmarkId::new("snapshot_load", history_len),
            &history_len,
            |b, _| {
                let repository = Repository::new(
                    &engine_store,
                    &stream,
                    "User",
                    &names,
                    StorageMode::EventsAndState,
                    Some("users_state"),
                );
                b.iter(|| {
                    let root = repository
                        .get_aggregate_root(&flavour, black_box(&id), Some(history_len))
                        .unwrap()
                        .unwrap();
                    black_box(root.version())
                });
            },
        );
    }

    group.finish();
}

fn bench_append_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_store_append");

    for batch in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let store = InMemoryMultiModelStore::new();
            let stream = Stream::of_write_model();
            store.create_stream(&stream).unwrap();
            let mut version = 0u64;
            b.iter(|| {
                let events: Vec<Message> = (0..batch)
                    .map(|_| {
                        version += 1;
                        Message::event("NameChanged", json!({"name": "N"}))
                            .unwrap()
                            .with_added_metadata(meta::AGGREGATE_TYPE, json!("User"))
                            .with_added_metadata(meta::AGGREGATE_ID, json!("U1"))
                            .with_added_metadata(meta::AGGREGATE_VERSION, json!(version))
                    })
                    .collect();
                store.append_to(&stream, events).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_dispatch_latency,
    bench_replay_paths,
    bench_append_throughput
);
criterion_main!(benches);
