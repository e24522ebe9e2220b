use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use procengine_core::{EntityKind, EntityRef};
use procengine_infra::db::{calculate_flush, DbOperation, Filter, InMemoryStorage};
use procengine_infra::jobs::JobEntity;
use procengine_infra::{CommandContext, FnCommand, JobStore, ProcessEngine};
use serde_json::{json, Value as JsonValue};

/// A deployment tree in the worst insert order: children first.
fn deployment_tree(definitions: usize) -> Vec<DbOperation> {
    let mut ops = Vec::new();
    for d in 0..definitions {
        let definition_id = format!("p{d}");
        for e in 0..4 {
            ops.push(DbOperation::insert(
                EntityKind::Execution,
                format!("e{d}-{e}"),
                json!({ "process_definition_id": definition_id }),
                vec![EntityRef::new(EntityKind::ProcessDefinition, definition_id.clone())],
            ));
        }
        ops.push(DbOperation::insert(
            EntityKind::ProcessDefinition,
            definition_id,
            json!({ "deployment_id": "d1" }),
            vec![EntityRef::new(EntityKind::Deployment, "d1")],
        ));
    }
    ops.push(DbOperation::insert(EntityKind::Deployment, "d1", json!({}), Vec::new()));
    ops.push(DbOperation::bulk_delete(
        EntityKind::Job,
        "deleteJobsByDeployment",
        Filter::eq("deployment_id", "d0"),
    ));
    ops.reverse();
    ops
}

fn bench_calculate_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("calculate_flush");

    for definitions in [1, 10, 100, 1000].iter() {
        let ops = deployment_tree(*definitions);
        group.throughput(Throughput::Elements(ops.len() as u64));
        group.bench_with_input(BenchmarkId::new("deployment_tree", definitions), &ops, |b, ops| {
            b.iter(|| calculate_flush(black_box(ops.clone())));
        });
    }

    group.finish();
}

fn bench_job_insert_command(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_execution");

    for jobs in [1, 10, 100].iter() {
        group.throughput(Throughput::Elements(*jobs as u64));
        group.bench_with_input(BenchmarkId::new("insert_jobs", jobs), jobs, |b, &jobs| {
            let engine = ProcessEngine::builder()
                .storage(Arc::new(InMemoryStorage::new()))
                .build()
                .unwrap();

            b.iter(|| {
                engine
                    .command_executor()
                    .execute(FnCommand::new("insert-jobs", move |ctx: &mut CommandContext| {
                        for _ in 0..jobs {
                            let job = JobEntity::new("noop", JsonValue::Null, 3, ctx.now());
                            ctx.insert_job(&job)?;
                        }
                        Ok(())
                    }))
                    .unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_calculate_flush, bench_job_insert_command);
criterion_main!(benches);
