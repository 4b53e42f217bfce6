//! End-to-end speculation: select, record, commit, then break the facts

mod common;
use common::*;

use devirt::assumptions::{AssumptionKind, SubjectKey};
use devirt::code::{CodeBuffer, CodeCache, PatchOutcome, PatchTarget, Word};
use devirt::commit::CommitError;
use devirt::guard::{GuardKind, TestType, VirtualGuard};
use devirt::hierarchy::{ClassDescriptor, NoClassSource};
use devirt::ids::{ClassId, CodeAddress, MethodId};
use devirt::ledger::Fact;
use devirt::profile::ClassProfile;
use devirt::selector::CallSite;
use devirt::{JitOptions, RuntimeEvent};
use pretty_assertions::assert_eq;

fn beagle() -> ClassDescriptor {
    ClassDescriptor::new(ClassId(40), "Beagle").extends(PUPPY).method(MethodId(400), SPEAK)
}

/// Overrides Dog.speak beside Puppy, not below it
fn wolf() -> ClassDescriptor {
    ClassDescriptor::new(ClassId(41), "Wolf").extends(DOG).method(MethodId(410), SPEAK)
}

mod non_overridden {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_commit_holds_only_while_unoverridden() {
        // override lands before the commit, or never
        for override_first in [false, true] {
            let runtime = zoo_runtime();
            let mut compilation = runtime.begin_compilation(None).unwrap();
            let selection = compilation
                .select_guard(&CallSite::virtual_call(DOG, SPEAK), &ClassProfile::new())
                .unwrap();
            assert!(matches!(selection.guard.kind, GuardKind::NonOverridden { method: DOG_SPEAK, .. }));
            assert_eq!(selection.target, DOG_SPEAK);

            if override_first {
                runtime.load_class(beagle(), &NoClassSource).unwrap();
            }
            match compilation.commit() {
                Ok(summary) => {
                    assert!(!override_first);
                    assert!(!runtime.lock().hierarchy.method_is_overridden(DOG_SPEAK));
                    assert_eq!(summary.preexistence, 0);
                }
                Err(e) => {
                    assert!(override_first);
                    assert_eq!(e, CommitError::MethodOverridden(DOG_SPEAK));
                    assert_eq!(runtime.stats().live(), 0);
                }
            }
        }
    }

    #[test]
    fn test_override_patches_the_guard_once() {
        let runtime = zoo_runtime();
        let mut compilation = runtime.begin_compilation(None).unwrap();
        let selection = compilation
            .select_guard(&CallSite::virtual_call(DOG, SPEAK), &ClassProfile::new())
            .unwrap();
        let site = selection.guard.sites[0];
        let body = compilation.commit().unwrap().body;
        assert_eq!(site_word(&runtime, body, site.location), Some(Word::Nop));

        let report = runtime.load_class(beagle(), &NoClassSource).unwrap();
        assert_eq!(report.patched, 1);
        let patched = site_word(&runtime, body, site.location);
        assert_eq!(patched, jump_to(&runtime, body, site.destination));

        // the assumption is gone; a second override changes nothing
        let again = runtime
            .load_class(
                ClassDescriptor::new(ClassId(41), "Poodle").extends(DOG).method(MethodId(410), SPEAK),
                &NoClassSource,
            )
            .unwrap();
        assert_eq!(again.fired, 0);
        assert_eq!(site_word(&runtime, body, site.location), patched);
    }
}

mod not_extended {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extending_a_leaf_patches_its_guard() {
        let runtime = zoo_runtime();
        let mut compilation = runtime.begin_compilation(None).unwrap();
        assert!(compilation.record_class_not_extended(ROCK));
        let index = compilation.add_guard(
            VirtualGuard::new(
                GuardKind::NonOverridden {
                    class: ROCK,
                    method: ROCK_ROLL,
                },
                TestType::VftTest,
            )
            .assuming(Fact::ClassNotExtended(ROCK)),
        )
        .unwrap();
        let site = compilation.ledger().guards()[index].sites[0];
        let summary = compilation.commit().unwrap();
        assert_eq!(summary.preexistence, 0);

        runtime
            .handle_event(RuntimeEvent::ClassLoaded {
                class: ClassDescriptor::new(ClassId(50), "Pebble").extends(ROCK),
            })
            .unwrap();

        assert!(runtime.lock().hierarchy.class_has_been_extended(ROCK));
        assert_eq!(
            site_word(&runtime, summary.body, site.location),
            jump_to(&runtime, summary.body, site.destination)
        );
    }

    #[test]
    fn test_uncovered_fact_recompiles_the_body() {
        let runtime = zoo_runtime();
        let mut compilation = runtime.begin_compilation(Some(ROCK_ROLL)).unwrap();
        compilation.record_class_not_extended(ROCK);
        let summary = compilation.commit().unwrap();
        assert_eq!(summary.preexistence, 1);
        assert!(runtime.lock().hierarchy.method(ROCK_ROLL).unwrap().compiled);

        let report = runtime
            .load_class(ClassDescriptor::new(ClassId(50), "Pebble").extends(ROCK), &NoClassSource)
            .unwrap();
        assert_eq!(report.invalidated, vec![summary.body]);
        assert!(runtime.lock().code.body(summary.body).unwrap().is_invalidated());
    }

    #[test]
    fn test_already_extended_class_fails_commit() {
        let runtime = zoo_runtime();
        let mut compilation = runtime.begin_compilation(None).unwrap();
        compilation.record_class_not_extended(DOG);
        assert_eq!(compilation.commit().unwrap_err(), CommitError::ClassExtended(DOG));
        assert!(runtime.lock().code.is_empty());
    }

    #[test]
    fn test_guard_assuming_extended_class_fails_commit() {
        let runtime = zoo_runtime();
        let mut compilation = runtime.begin_compilation(None).unwrap();
        compilation
            .add_guard(VirtualGuard::new(GuardKind::Dummy, TestType::DummyTest).assuming(Fact::ClassNotExtended(DOG)))
            .unwrap();
        assert_eq!(compilation.ledger().classes_not_extended(), &[DOG]);
        assert_eq!(compilation.commit().unwrap_err(), CommitError::ClassExtended(DOG));
        assert!(runtime.lock().code.is_empty());
        assert!(runtime.lock().assumptions.is_empty());
    }
}

mod hierarchy_guard {
    use super::*;
    use pretty_assertions::assert_eq;

    fn select(compilation: &mut devirt::Compilation) -> devirt::selector::Selection {
        let site = CallSite::virtual_call(ANIMAL, SPEAK).bounded_by(PUPPY);
        let selection = compilation.select_guard(&site, &ClassProfile::new()).unwrap();
        assert!(matches!(selection.guard.kind, GuardKind::Hierarchy { class: PUPPY, .. }));
        assert_eq!(selection.target, DOG_SPEAK);
        selection
    }

    #[test]
    fn test_override_below_bound_before_commit_fails() {
        let runtime = zoo_runtime();
        runtime.load_class(wolf(), &NoClassSource).unwrap();
        let mut compilation = runtime.begin_compilation(None).unwrap();
        select(&mut compilation);
        assert_eq!(compilation.ledger().classes_not_newly_extended(), &[PUPPY]);

        runtime.load_class(beagle(), &NoClassSource).unwrap();
        assert!(matches!(compilation.commit(), Err(CommitError::SlotPoisoned(_))));
        assert!(runtime.lock().code.is_empty());
    }

    #[test]
    fn test_override_below_bound_after_commit_patches() {
        let runtime = zoo_runtime();
        runtime.load_class(wolf(), &NoClassSource).unwrap();
        let mut compilation = runtime.begin_compilation(None).unwrap();
        let site = select(&mut compilation).guard.sites[0];
        let body = compilation.commit().unwrap().body;
        assert_eq!(site_word(&runtime, body, site.location), Some(Word::Nop));

        let report = runtime.load_class(beagle(), &NoClassSource).unwrap();
        assert!(report.patched >= 1);
        assert_eq!(site_word(&runtime, body, site.location), jump_to(&runtime, body, site.destination));
    }
}

mod native {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_registration_repoints_native_call() {
        let runtime = zoo_runtime();
        let mut compilation = runtime.begin_compilation(None).unwrap();
        let call = compilation.add_native_call_site(ROCK_ROLL);
        let summary = compilation.commit().unwrap();
        assert_eq!(summary.registered, 1);
        assert_eq!(
            runtime
                .lock()
                .assumptions
                .count(AssumptionKind::OnRegisterNative, SubjectKey::Method(ROCK_ROLL)),
            1
        );

        let native = CodeAddress(0x7f00_1000);
        let report = runtime
            .handle_event(RuntimeEvent::NativeRegistered {
                method: ROCK_ROLL,
                address: native,
            })
            .unwrap();
        assert_eq!(report.patched, 1);
        assert_eq!(site_word(&runtime, summary.body, call), Some(Word::Jump(native)));
        assert!(runtime.lock().assumptions.is_empty());
    }
}

mod interface {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_implementer_patches_interface_guard() {
        let runtime = zoo_runtime();
        let mut compilation = runtime.begin_compilation(None).unwrap();
        let selection = compilation
            .select_guard(&CallSite::interface_call(PET, NAME).bounded_by(CAT), &ClassProfile::new())
            .unwrap();
        assert!(matches!(selection.guard.kind, GuardKind::Interface { class: PET, .. }));
        assert_eq!(selection.target, CAT_NAME);
        let site = selection.guard.sites[0];
        let body = compilation.commit().unwrap().body;
        assert!(runtime.lock().assumptions.count(AssumptionKind::OnClassExtend, SubjectKey::Class(PET)) >= 1);

        runtime
            .load_class(
                ClassDescriptor::new(ClassId(60), "Parrot").implements(PET).method(MethodId(600), NAME),
                &NoClassSource,
            )
            .unwrap();
        assert_eq!(site_word(&runtime, body, site.location), jump_to(&runtime, body, site.destination));
    }

    #[test]
    fn test_unbounded_receiver_gets_a_real_test() {
        let runtime = zoo_runtime();
        let mut compilation = runtime.begin_compilation(None).unwrap();
        let selection = compilation
            .select_guard(&CallSite::interface_call(PET, NAME), &ClassProfile::new())
            .unwrap();
        assert_eq!(
            selection.guard.kind,
            GuardKind::Profiled {
                class: CAT,
                method: CAT_NAME,
                required_type: Some(PET)
            }
        );
        assert_eq!(selection.guard.test_type, TestType::VftTest);
        assert!(selection.guard.sites.is_empty());
    }
}

mod lifecycle {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_abort_leaves_nothing_registered() {
        let runtime = zoo_runtime();
        let mut compilation = runtime.begin_compilation(None).unwrap();
        compilation.record_class_not_extended(ROCK);
        compilation.record_class_not_newly_extended(DOG);
        compilation.record_class_not_newly_extended(PUPPY);
        compilation.record_method_not_overridden(DOG_SPEAK).unwrap();
        compilation.record_static_final_field_class(CAT);
        compilation
            .select_guard(&CallSite::virtual_call(DOG, SPEAK), &ClassProfile::new())
            .unwrap();
        assert_eq!(compilation.ledger().fact_count(), 4);
        compilation.abort();

        let state = runtime.lock();
        assert!(state.assumptions.is_empty());
        assert_eq!(state.assumptions.stats().total().registered, 0);
        assert_eq!(state.hierarchy.find_class_info(DOG).unwrap().should_not_be_newly_extended(), 0);
        assert_eq!(state.hierarchy.find_class_info(PUPPY).unwrap().should_not_be_newly_extended(), 0);
        assert!(state.code.is_empty());
        drop(state);
        assert_eq!(runtime.active_compilations(), 0);
    }

    #[test]
    fn test_unknown_method_cannot_be_recorded() {
        let runtime = zoo_runtime();
        let mut compilation = runtime.begin_compilation(None).unwrap();
        assert!(compilation.record_method_not_overridden(MethodId(999)).is_err());
    }

    #[test]
    fn test_guard_promises_released_on_abort() {
        let runtime = zoo_runtime_with(JitOptions {
            max_compile_threads: 1,
            ..JitOptions::default()
        });
        let mut compilation = runtime.begin_compilation(None).unwrap();
        compilation
            .add_guard(VirtualGuard::new(GuardKind::Dummy, TestType::DummyTest).assuming(Fact::ClassNotNewlyExtended(ROCK)))
            .unwrap();
        compilation.abort();
        assert_eq!(runtime.lock().hierarchy.find_class_info(ROCK).unwrap().should_not_be_newly_extended(), 0);

        let unrelated = runtime.begin_compilation(None).unwrap();
        runtime
            .load_class(ClassDescriptor::new(ClassId(50), "Pebble").extends(ROCK), &NoClassSource)
            .unwrap();
        assert!(unrelated.commit().is_ok());
    }

    #[test]
    fn test_static_final_only_ledger_is_validated() {
        let runtime = zoo_runtime();
        let mut compilation = runtime.begin_compilation(None).unwrap();
        compilation.record_static_final_field_class(CAT);
        assert!(!compilation.ledger().uses_preexistence());
        runtime
            .handle_event(RuntimeEvent::StaticFinalFieldModified { class: CAT })
            .unwrap();
        assert_eq!(compilation.commit().unwrap_err(), CommitError::StaticFinalModified(CAT));
    }

    #[test]
    fn test_static_final_change_fails_commit() {
        let runtime = zoo_runtime();
        let mut compilation = runtime.begin_compilation(None).unwrap();
        compilation.record_class_not_extended(ROCK);
        compilation.record_static_final_field_class(CAT);
        runtime
            .handle_event(RuntimeEvent::StaticFinalFieldModified { class: CAT })
            .unwrap();
        assert_eq!(compilation.commit().unwrap_err(), CommitError::StaticFinalModified(CAT));
    }

    #[test]
    fn test_patching_twice_is_the_same_as_once() {
        let mut cache = CodeCache::new();
        let mut buffer = CodeBuffer::new();
        let location = buffer.emit_patchable_site();
        let destination = buffer.emit_deopt_stub();
        let body = cache.allocate(buffer, None);
        let (at, to) = (body.address_of(location), body.address_of(destination));

        assert_eq!(cache.patch(at, to).unwrap(), PatchOutcome::Patched);
        let once = body.read(at);
        assert_eq!(cache.patch(at, to).unwrap(), PatchOutcome::AlreadyPatched);
        assert_eq!(body.read(at), once);
        assert_eq!(once, Some(Word::Jump(to)));
    }
}
