//! Compile threads racing each other and the class loader

mod common;
use common::*;

use std::sync::{Arc, Barrier};
use std::thread;

use devirt::assumptions::{AssumptionKind, SubjectKey};
use devirt::commit::CommitError;
use devirt::hierarchy::{ClassDescriptor, NoClassSource};
use devirt::ids::{BodyId, ClassId, MethodId};
use devirt::profile::ClassProfile;
use devirt::selector::CallSite;
use devirt::{Error, JitOptions};

const COMPILE_THREADS: usize = 4;

#[test]
fn test_parallel_commits_share_one_patch_event() {
    let runtime = zoo_runtime();
    let barrier = Arc::new(Barrier::new(COMPILE_THREADS));

    let handles: Vec<_> = (0..COMPILE_THREADS)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut compilation = runtime.begin_compilation(None).unwrap();
                barrier.wait();
                let selection = compilation
                    .select_guard(&CallSite::virtual_call(DOG, SPEAK), &ClassProfile::new())
                    .unwrap();
                let site = selection.guard.sites[0];
                (compilation.commit().unwrap().body, site)
            })
        })
        .collect();
    let committed: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(runtime.active_compilations(), 0);
    assert_eq!(
        runtime
            .lock()
            .assumptions
            .count(AssumptionKind::OnMethodOverride, SubjectKey::Method(DOG_SPEAK)),
        COMPILE_THREADS
    );

    let report = runtime
        .load_class(
            ClassDescriptor::new(ClassId(40), "Beagle").extends(PUPPY).method(MethodId(400), SPEAK),
            &NoClassSource,
        )
        .unwrap();
    assert_eq!(report.patched, COMPILE_THREADS);
    for (body, site) in committed {
        assert_eq!(site_word(&runtime, body, site.location), jump_to(&runtime, body, site.destination));
    }
}

#[test]
fn test_promises_race_the_loader() {
    let runtime = zoo_runtime();
    let rounds = 25;

    let compilers: Vec<_> = (0..COMPILE_THREADS)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || {
                let mut committed: Vec<BodyId> = Vec::new();
                for _ in 0..rounds {
                    let mut compilation = runtime.begin_compilation(None).unwrap();
                    compilation.record_class_not_newly_extended(ROCK);
                    thread::yield_now();
                    match compilation.commit() {
                        Ok(summary) => committed.push(summary.body),
                        Err(CommitError::SlotPoisoned(_)) | Err(CommitError::ClassNewlyExtended { .. }) => {}
                        Err(e) => panic!("unexpected commit failure: {}", e),
                    }
                }
                committed
            })
        })
        .collect();

    let loader = {
        let runtime = Arc::clone(&runtime);
        thread::spawn(move || {
            for i in 0..5u64 {
                thread::yield_now();
                runtime
                    .load_class(
                        ClassDescriptor::new(ClassId(100 + i), format!("Pebble{}", i)).extends(ROCK),
                        &NoClassSource,
                    )
                    .unwrap();
            }
        })
    };

    loader.join().unwrap();
    let committed: Vec<BodyId> = compilers.into_iter().flat_map(|h| h.join().unwrap()).collect();

    // every body that committed did so before Rock's first subclass, and
    // that load sent it to recompilation
    let state = runtime.lock();
    assert!(state.hierarchy.class_has_been_extended(ROCK));
    for body in committed {
        let body = state.code.body(body).unwrap();
        assert!(body.is_invalidated(), "body {} survived a broken promise", body.id());
    }
    assert_eq!(state.hierarchy.find_class_info(ROCK).unwrap().should_not_be_newly_extended(), 0);
}

#[test]
fn test_slots_cap_concurrent_compilations() {
    let runtime = zoo_runtime_with(JitOptions {
        max_compile_threads: 2,
        ..JitOptions::default()
    });
    let first = runtime.begin_compilation(None).unwrap();
    let second = runtime.begin_compilation(None).unwrap();
    assert!(matches!(runtime.begin_compilation(None), Err(Error::NoCompileSlot(2))));

    let released = first.slot();
    drop(first);
    assert_eq!(runtime.begin_compilation(None).unwrap().slot(), released);
    drop(second);
    assert_eq!(runtime.active_compilations(), 0);
}
