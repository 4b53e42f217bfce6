//! Performance benchmarks for devirt
//!
//! Run with: cargo bench
//!
//! These benchmarks measure the paths a compile thread or the class loader
//! takes while holding the class-table lock:
//! - Capped implementer collection over wide and deep hierarchies
//! - A full commit (validate, register, install)
//! - Cast planning
//! - Event dispatch that patches many guard sites

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use devirt::casts::{CastClassRef, CastOp, CastRequest, CastTestPlanner};
use devirt::hierarchy::{ClassDescriptor, ClassFlags, ClassHierarchy, NoClassSource};
use devirt::ids::{BodyId, ClassId, MethodId, Selector};
use devirt::profile::ClassProfile;
use devirt::selector::CallSite;
use devirt::{JitOptions, JitRuntime, RuntimeEvent};

const RUN: &str = "run()V";

/// Object(1) <- Base(2, run) <- `width` leaves, every one overriding run
fn wide(width: u64) -> Vec<ClassDescriptor> {
    let mut classes = vec![
        ClassDescriptor::new(ClassId(1), "Object"),
        ClassDescriptor::new(ClassId(2), "Base")
            .with_flags(ClassFlags::ABSTRACT)
            .abstract_method(MethodId(2), RUN),
    ];
    for i in 0..width {
        let id = 10 + i;
        classes.push(
            ClassDescriptor::new(ClassId(id), format!("Leaf{}", i))
                .extends(ClassId(2))
                .method(MethodId(id), RUN),
        );
    }
    classes
}

/// A single chain of `depth` classes below Object, none overriding run
fn deep(depth: u64) -> Vec<ClassDescriptor> {
    let mut classes = vec![
        ClassDescriptor::new(ClassId(1), "Object"),
        ClassDescriptor::new(ClassId(2), "Base").method(MethodId(2), RUN),
    ];
    for i in 0..depth {
        classes.push(ClassDescriptor::new(ClassId(10 + i), format!("Level{}", i)).extends(ClassId(if i == 0 { 2 } else { 9 + i })));
    }
    classes
}

fn hierarchy(classes: Vec<ClassDescriptor>) -> ClassHierarchy {
    let mut h = ClassHierarchy::default();
    for c in classes {
        h.class_loaded(c, &NoClassSource).unwrap();
    }
    h
}

fn runtime(classes: Vec<ClassDescriptor>) -> std::sync::Arc<JitRuntime> {
    let rt = JitRuntime::new(JitOptions::default());
    for c in classes {
        rt.load_class(c, &NoClassSource).unwrap();
    }
    rt
}

/// Keep the code cache from growing across iterations
fn discard(rt: &JitRuntime, body: Option<BodyId>) {
    if let Some(body) = black_box(body) {
        rt.handle_event(RuntimeEvent::BodyDiscarded { body }).unwrap();
    }
}

/// Benchmark: implementer collection, answered and over budget
fn bench_collect_implementers(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect_implementers");
    let run = Selector::new(RUN);

    for size in [10u64, 100, 1000] {
        let h = hierarchy(wide(size));
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::new("wide", size), &size, |b, _| {
            b.iter(|| black_box(h.collect_implementers(ClassId(2), black_box(2), &run)))
        });

        let h = hierarchy(deep(size));
        group.bench_with_input(BenchmarkId::new("deep", size), &size, |b, _| {
            b.iter(|| black_box(h.find_single_implementer(ClassId(2), &run)))
        });
    }

    group.finish();
}

/// Benchmark: select a guard and commit a body
fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");

    group.bench_function("non_overridden_guard", |b| {
        let rt = runtime(deep(50));
        let site = CallSite::virtual_call(ClassId(2), RUN);
        let profile = ClassProfile::new();
        b.iter(|| {
            let mut compilation = rt.begin_compilation(None).unwrap();
            black_box(compilation.select_guard(&site, &profile));
            discard(&rt, compilation.commit().ok().map(|s| s.body))
        })
    });

    group.bench_function("not_newly_extended_subtree", |b| {
        let rt = runtime(deep(50));
        b.iter(|| {
            let mut compilation = rt.begin_compilation(None).unwrap();
            for id in 10..60 {
                compilation.record_class_not_newly_extended(ClassId(id));
            }
            compilation.record_class_not_newly_extended(ClassId(2));
            discard(&rt, compilation.commit().ok().map(|s| s.body))
        })
    });

    group.finish();
}

/// Benchmark: cast planning for the common cast-class shapes
fn bench_cast_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("cast_plan");
    let h = hierarchy(wide(100));
    let options = JitOptions::default();
    let planner = CastTestPlanner::new(&h, &options);

    let mut profile = ClassProfile::new();
    for i in 0..8 {
        profile.record(ClassId(10 + i), 100 - i * 10);
    }
    let requests = [
        ("leaf", CastRequest::new(CastOp::CheckCast, CastClassRef::Resolved(ClassId(10)))),
        ("abstract", CastRequest::new(CastOp::InstanceOf, CastClassRef::Resolved(ClassId(2))).may_be_null()),
        (
            "profiled",
            CastRequest::new(CastOp::InstanceOf, CastClassRef::Resolved(ClassId(2))).with_profile(profile),
        ),
        ("unresolved", CastRequest::new(CastOp::CheckCast, CastClassRef::Unresolved)),
    ];
    for (name, request) in &requests {
        group.bench_function(*name, |b| b.iter(|| black_box(planner.plan(black_box(request)))));
    }

    group.finish();
}

/// Benchmark: one class load patching every committed guard
fn bench_event_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_dispatch");

    for bodies in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(bodies as u64));
        group.bench_with_input(BenchmarkId::new("override_patch", bodies), &bodies, |b, &bodies| {
            b.iter_batched(
                || {
                    let rt = runtime(deep(4));
                    let site = CallSite::virtual_call(ClassId(2), RUN);
                    for _ in 0..bodies {
                        let mut compilation = rt.begin_compilation(None).unwrap();
                        compilation.select_guard(&site, &ClassProfile::new());
                        compilation.commit().unwrap();
                    }
                    rt
                },
                |rt| {
                    let overrider = ClassDescriptor::new(ClassId(500), "Overrider")
                        .extends(ClassId(13))
                        .method(MethodId(500), RUN);
                    black_box(rt.load_class(overrider, &NoClassSource).unwrap())
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_collect_implementers,
    bench_commit,
    bench_cast_planning,
    bench_event_dispatch,
);

criterion_main!(benches);
