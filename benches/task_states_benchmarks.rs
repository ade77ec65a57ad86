use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use query_coordinator::models::QueryKey;
use query_coordinator::state_machine::{TaskIdSet, TaskState, TaskStates};
use uuid::Uuid;

/// Every `stride`-th id of `count` ids completed, the rest ready
fn sparse_states(count: u32, stride: u32) -> TaskStates {
    let mut states = TaskStates::new(QueryKey::new("bench", Uuid::new_v4(), "BenchQuery"), 8);
    for _ in 0..count {
        let Ok(task_id) = states.new_task_id() else { break };
        let state = if task_id % stride == 0 {
            TaskState::Completed
        } else {
            TaskState::Ready
        };
        states.set_state(task_id, Some(state));
    }
    states
}

fn benchmark_set_state(c: &mut Criterion) {
    c.bench_function("set_state_ready_running_completed", |b| {
        b.iter(|| {
            let mut states = TaskStates::new(QueryKey::new("bench", Uuid::nil(), "BenchQuery"), 4);
            for _ in 0..1_000 {
                let Ok(task_id) = states.new_task_id() else { break };
                states.set_state(task_id, Some(TaskState::Ready));
                if states.set_state(task_id, Some(TaskState::Running)) {
                    states.set_state(task_id, Some(TaskState::Completed));
                }
            }
            black_box(states)
        })
    });
}

fn benchmark_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_states_json");
    for count in [1_000u32, 100_000] {
        let states = sparse_states(count, 7);
        let encoded = serde_json::to_string(&states).unwrap_or_default();

        group.bench_with_input(BenchmarkId::new("encode", count), &states, |b, states| {
            b.iter(|| serde_json::to_string(black_box(states)))
        });
        group.bench_with_input(BenchmarkId::new("decode", count), &encoded, |b, encoded| {
            b.iter(|| serde_json::from_str::<TaskStates>(black_box(encoded)))
        });
    }
    group.finish();
}

fn benchmark_id_set_parse(c: &mut Criterion) {
    let encoded = (1..=50_000u32).filter(|id| id % 3 != 0).collect::<TaskIdSet>().encode();
    c.bench_function("id_set_parse_sparse", |b| {
        b.iter(|| black_box(&encoded).parse::<TaskIdSet>())
    });
}

criterion_group!(
    benches,
    benchmark_set_state,
    benchmark_serialization,
    benchmark_id_set_parse
);
criterion_main!(benches);
