use std::path::PathBuf;

use criterion::{criterion_group, criterion_main, Criterion};
use migration_engine_core::{
    history, plan, Migration, MigrationGraph, Version, VersionId, VersionScheme,
};

const SOURCE: &str = "-- migrate:up\nCREATE TABLE t (id INTEGER);\n-- migrate:down\nDROP TABLE t;\n";

fn mk_migration(version: u64) -> Migration {
    let label = format!("bench_step_{version}");
    let path = PathBuf::from(format!("{version:04}_{label}.sql"));
    match Migration::from_source(Version(version), &label, SOURCE, path) {
        Ok(migration) => migration,
        Err(err) => panic!("benchmark fixture migration {version} is invalid: {err}"),
    }
}

fn mk_graph(len: u64) -> MigrationGraph {
    // Reverse order so validation pays for the sort.
    let migrations = (1..=len).rev().map(mk_migration).collect::<Vec<_>>();
    match MigrationGraph::from_migrations(migrations, VersionScheme::Sequence) {
        Ok(graph) => graph,
        Err(err) => panic!("benchmark graph is invalid: {err}"),
    }
}

fn bench_validate(c: &mut Criterion) {
    let migrations = (1..=10_000).rev().map(mk_migration).collect::<Vec<_>>();

    c.bench_function("validate_graph_10000_migrations", |b| {
        b.iter(|| {
            if let Err(err) =
                MigrationGraph::from_migrations(migrations.clone(), VersionScheme::Sequence)
            {
                panic!("graph validation failed: {err}");
            }
        });
    });
}

fn bench_plans(c: &mut Criterion) {
    let graph = mk_graph(10_000);
    let head = graph.head();

    c.bench_function("plan_base_to_head_10000_migrations", |b| {
        b.iter(|| {
            if let Err(err) = plan(&graph, VersionId::Base, head) {
                panic!("upgrade plan failed: {err}");
            }
        });
    });

    c.bench_function("plan_head_to_base_10000_migrations", |b| {
        b.iter(|| {
            if let Err(err) = plan(&graph, head, VersionId::Base) {
                panic!("downgrade plan failed: {err}");
            }
        });
    });

    c.bench_function("history_10000_migrations", |b| {
        b.iter(|| history(&graph, VersionId::At(Version(5_000))).len());
    });
}

criterion_group!(planner_benches, bench_validate, bench_plans);
criterion_main!(planner_benches);
