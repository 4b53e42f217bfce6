//! Guard selection for virtual and interface call sites
//!
//! Picks the cheapest guard whose correctness the current hierarchy can
//! vouch for, recording the facts it leans on into the compilation's
//! ledger. The first applicable rule wins:
//!
//! | Rule | Guard | Test |
//! |------|-------|------|
//! | target not overridden anywhere | NonOverridden | method |
//! | target not overridden below the receiver bound | Hierarchy | method |
//! | interface with one implementer, class bound known | Interface | method |
//! | interface with one implementer, no bound | Profiled, receiver constrained to the interface | vft or method |
//! | abstract receiver with one implementer | Abstract | method |
//! | one profiled receiver above the frequency threshold | Profiled | see [`GuardSelector::profiled_test_type`] |

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::JitOptions;
use crate::guard::{GuardKind, TestType, VirtualGuard};
use crate::hierarchy::{ClassHierarchy, ClassNode};
use crate::ids::{ClassId, MethodId, Selector};
use crate::ledger::{AssumptionLedger, Fact, ResolvedMethod};
use crate::profile::{ClassProfile, ProfileEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Virtual,
    Interface,
}

/// A call site as the inliner sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub selector: Selector,
    /// Class (or interface) named by the call bytecode
    pub declared_class: ClassId,
    /// Narrower static type of the receiver, when known
    #[serde(default)]
    pub receiver_bound: Option<ClassId>,
    pub kind: CallKind,
}

impl CallSite {
    pub fn virtual_call(declared_class: ClassId, selector: &str) -> Self {
        Self {
            selector: Selector::new(selector),
            declared_class,
            receiver_bound: None,
            kind: CallKind::Virtual,
        }
    }

    pub fn interface_call(interface: ClassId, selector: &str) -> Self {
        Self {
            selector: Selector::new(selector),
            declared_class: interface,
            receiver_bound: None,
            kind: CallKind::Interface,
        }
    }

    pub fn bounded_by(mut self, class: ClassId) -> Self {
        self.receiver_bound = Some(class);
        self
    }

    /// The tightest class known for the receiver
    pub fn receiver_class(&self) -> ClassId {
        self.receiver_bound.unwrap_or(self.declared_class)
    }
}

/// A chosen guard and the method it lets the compiler call directly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub guard: VirtualGuard,
    pub target: MethodId,
}

pub struct GuardSelector<'a> {
    hierarchy: &'a ClassHierarchy,
    options: &'a JitOptions,
}

impl<'a> GuardSelector<'a> {
    pub fn new(hierarchy: &'a ClassHierarchy, options: &'a JitOptions) -> Self {
        Self { hierarchy, options }
    }

    /// Choose a guard for `site`; `None` means ordinary dispatch
    pub fn select(&self, site: &CallSite, profile: &ClassProfile, ledger: &mut AssumptionLedger) -> Option<Selection> {
        let selection = self.structural(site, ledger).or_else(|| self.profiled(site, profile));
        match &selection {
            Some(s) => debug!(selector = %site.selector, guard = %s.guard, target = %s.target, "guard selected"),
            None => debug!(selector = %site.selector, "no guard, ordinary dispatch"),
        }
        selection
    }

    fn structural(&self, site: &CallSite, ledger: &mut AssumptionLedger) -> Option<Selection> {
        if self.options.disable_ch_opts {
            return None;
        }
        match site.kind {
            CallKind::Virtual => self
                .non_overridden(site, ledger)
                .or_else(|| self.hierarchy_guard(site, ledger))
                .or_else(|| self.abstract_guard(site, ledger)),
            CallKind::Interface => self.interface_guard(site, ledger),
        }
    }

    fn resolved(&self, method: MethodId) -> Option<ResolvedMethod> {
        let info = self.hierarchy.method(method)?;
        Some(ResolvedMethod {
            id: info.id,
            owner: info.owner,
            selector: info.selector.clone(),
        })
    }

    fn concrete_target(&self, class: ClassId, selector: &Selector) -> Option<MethodId> {
        let target = self.hierarchy.resolve_virtual(class, selector)?;
        match self.hierarchy.method(target) {
            Some(info) if !info.is_abstract => Some(target),
            _ => None,
        }
    }

    fn non_overridden(&self, site: &CallSite, ledger: &mut AssumptionLedger) -> Option<Selection> {
        let receiver = site.receiver_class();
        let target = self.concrete_target(receiver, &site.selector)?;
        if self.hierarchy.method_is_overridden(target) {
            return None;
        }
        ledger.record_method_not_overridden(self.resolved(target)?);
        let guard = VirtualGuard::new(
            GuardKind::NonOverridden {
                class: receiver,
                method: target,
            },
            TestType::MethodTest,
        )
        .assuming(Fact::MethodNotOverridden(target));
        Some(Selection { guard, target })
    }

    /// Overriders elsewhere do not matter; a new class below the bound might override
    fn hierarchy_guard(&self, site: &CallSite, ledger: &mut AssumptionLedger) -> Option<Selection> {
        let bound = site.receiver_bound.filter(|b| *b != site.declared_class)?;
        let target = self.concrete_target(bound, &site.selector)?;
        if self.hierarchy.is_overridden_in_this_hierarchy(target, bound) {
            return None;
        }
        let mut guard = VirtualGuard::new(
            GuardKind::Hierarchy {
                class: bound,
                method: target,
            },
            TestType::MethodTest,
        );
        self.record_subtree(bound, &mut guard, ledger);
        Some(Selection { guard, target })
    }

    /// Promise the whole current subtree of `top`; the guard assumes every promise
    fn record_subtree(&self, top: ClassId, guard: &mut VirtualGuard, ledger: &mut AssumptionLedger) {
        for class in self.hierarchy.subtree(top) {
            ledger.record_class_not_newly_extended(class);
            let fact = Fact::ClassNotNewlyExtended(class);
            if !guard.assumes.contains(&fact) {
                guard.assumes.push(fact);
            }
        }
    }

    fn interface_guard(&self, site: &CallSite, ledger: &mut AssumptionLedger) -> Option<Selection> {
        let interface = site.declared_class;
        if !self.hierarchy.find_class_info(interface)?.is_interface() {
            return None;
        }
        let target = self.hierarchy.find_single_implementer(interface, &site.selector)?;
        let resolved = self.resolved(target)?;

        if site.receiver_bound.is_none() {
            // Verification does not guarantee the receiver implements the
            // interface, so the fallback guard must check it
            let (class, test_type) = match self.hierarchy.find_single_concrete_subclass(interface) {
                Some(only) => (only, TestType::VftTest),
                None => (resolved.owner, TestType::MethodTest),
            };
            let guard = VirtualGuard::new(
                GuardKind::Profiled {
                    class,
                    method: target,
                    required_type: Some(interface),
                },
                test_type,
            );
            return Some(Selection { guard, target });
        }

        if self.hierarchy.method_is_overridden(target) {
            return None;
        }
        let mut guard = VirtualGuard::new(
            GuardKind::Interface {
                class: interface,
                selector: site.selector.clone(),
            },
            TestType::MethodTest,
        );
        self.record_subtree(interface, &mut guard, ledger);
        ledger.record_method_not_overridden(resolved);
        guard.assumes.push(Fact::MethodNotOverridden(target));
        Some(Selection { guard, target })
    }

    fn abstract_guard(&self, site: &CallSite, ledger: &mut AssumptionLedger) -> Option<Selection> {
        let receiver = site.receiver_class();
        let node = self.hierarchy.find_class_info(receiver)?;
        if !node.is_abstract() || node.is_interface() {
            return None;
        }
        let target = self.hierarchy.find_single_abstract_implementer(receiver, &site.selector)?;
        let mut guard = VirtualGuard::new(
            GuardKind::Abstract {
                class: receiver,
                selector: site.selector.clone(),
            },
            TestType::MethodTest,
        );
        self.record_subtree(receiver, &mut guard, ledger);
        Some(Selection { guard, target })
    }

    /// Profile entries that could really reach the site, hottest first
    pub fn filter_profile(&self, profile: &ClassProfile, required: ClassId) -> Vec<ProfileEntry> {
        profile
            .sorted()
            .into_iter()
            .filter(|e| !self.hierarchy.is_obsolete_class(e.class))
            .filter(|e| self.hierarchy.is_instance_of(e.class, required))
            .collect()
    }

    fn profiled(&self, site: &CallSite, profile: &ClassProfile) -> Option<Selection> {
        let candidates = self.filter_profile(profile, site.receiver_class());
        let top = *candidates.first()?;
        if profile.frequency(top.count) < self.options.min_profiled_call_frequency {
            return None;
        }
        let node = self.hierarchy.find_class_info(top.class)?;
        if !node.is_concrete() {
            return None;
        }
        let target = self.concrete_target(top.class, &site.selector)?;
        let remaining: u64 = candidates.iter().map(|e| e.count).sum();
        let test_type = self.profiled_test_type(node, top.count, remaining);
        let required_type = (site.kind == CallKind::Interface).then_some(site.declared_class);

        let guard = VirtualGuard::new(
            GuardKind::Profiled {
                class: top.class,
                method: target,
                required_type,
            },
            test_type,
        );
        Some(Selection { guard, target })
    }

    /// Final class: vft. Not yet extended: vft, a cheap bet. Extended: method
    /// test, which keeps working for future subclasses, unless the class
    /// took every filtered sample of a well-sampled site.
    pub fn profiled_test_type(&self, node: &ClassNode, top_count: u64, remaining: u64) -> TestType {
        if node.is_final() {
            return TestType::VftTest;
        }
        if !node.has_been_extended() {
            return if self.options.prefer_method_test_at_startup {
                TestType::MethodTest
            } else {
                TestType::VftTest
            };
        }
        if remaining >= self.options.high_probability_min_samples && top_count == remaining {
            TestType::VftTest
        } else {
            TestType::MethodTest
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{ClassDescriptor, ClassFlags, NoClassSource};

    const SPEAK: &str = "speak()V";
    const AREA: &str = "area()D";

    // Object(1)
    //   Animal(2, abstract) <- Dog(3) <- Puppy(4)
    //   Shape(10, interface) <- Circle(11)
    //   Point(20, final)
    //   Logger(30) with log()V, never overridden
    fn hierarchy(options: &JitOptions) -> ClassHierarchy {
        let mut h = ClassHierarchy::new(options);
        for c in [
            ClassDescriptor::new(ClassId(1), "Object"),
            ClassDescriptor::new(ClassId(2), "Animal")
                .with_flags(ClassFlags::ABSTRACT)
                .abstract_method(MethodId(20), SPEAK),
            ClassDescriptor::new(ClassId(3), "Dog").extends(ClassId(2)).method(MethodId(30), SPEAK),
            ClassDescriptor::new(ClassId(4), "Puppy").extends(ClassId(3)),
            ClassDescriptor::new(ClassId(10), "Shape")
                .with_flags(ClassFlags::INTERFACE)
                .abstract_method(MethodId(100), AREA),
            ClassDescriptor::new(ClassId(11), "Circle").implements(ClassId(10)).method(MethodId(110), AREA),
            ClassDescriptor::new(ClassId(20), "Point").with_flags(ClassFlags::FINAL).method(MethodId(200), SPEAK),
            ClassDescriptor::new(ClassId(30), "Logger").method(MethodId(300), "log()V"),
        ] {
            h.class_loaded(c, &NoClassSource).unwrap();
        }
        h
    }

    #[test]
    fn test_non_overridden_guard() {
        let options = JitOptions::default();
        let h = hierarchy(&options);
        let mut ledger = AssumptionLedger::new();
        let selection = GuardSelector::new(&h, &options)
            .select(&CallSite::virtual_call(ClassId(30), "log()V"), &ClassProfile::new(), &mut ledger)
            .unwrap();

        assert!(matches!(selection.guard.kind, GuardKind::NonOverridden { method: MethodId(300), .. }));
        assert_eq!(selection.guard.test_type, TestType::MethodTest);
        assert_eq!(ledger.methods_not_overridden()[0].id, MethodId(300));
        assert!(ledger.uses_preexistence());
    }

    #[test]
    fn test_hierarchy_guard_below_bound() {
        let options = JitOptions::default();
        let mut h = hierarchy(&options);
        // Dog.speak is overridden somewhere, but not below Puppy
        h.class_loaded(
            ClassDescriptor::new(ClassId(5), "Wolf").extends(ClassId(3)).method(MethodId(50), SPEAK),
            &NoClassSource,
        )
        .unwrap();
        let mut ledger = AssumptionLedger::new();
        let site = CallSite::virtual_call(ClassId(2), SPEAK).bounded_by(ClassId(4));
        let selection = GuardSelector::new(&h, &options).select(&site, &ClassProfile::new(), &mut ledger).unwrap();
        assert!(matches!(selection.guard.kind, GuardKind::Hierarchy { class: ClassId(4), .. }));
        assert_eq!(selection.target, MethodId(30));
        assert_eq!(ledger.classes_not_newly_extended(), &[ClassId(4)]);
        assert_eq!(selection.guard.assumes, vec![Fact::ClassNotNewlyExtended(ClassId(4))]);
    }

    #[test]
    fn test_interface_guard_with_bound() {
        let options = JitOptions::default();
        let h = hierarchy(&options);
        let mut ledger = AssumptionLedger::new();
        let site = CallSite::interface_call(ClassId(10), AREA).bounded_by(ClassId(11));
        let selection = GuardSelector::new(&h, &options).select(&site, &ClassProfile::new(), &mut ledger).unwrap();

        assert!(matches!(selection.guard.kind, GuardKind::Interface { class: ClassId(10), .. }));
        assert_eq!(selection.target, MethodId(110));
        assert_eq!(ledger.classes_not_newly_extended(), &[ClassId(10), ClassId(11)]);
        assert!(selection.guard.assumes.contains(&Fact::MethodNotOverridden(MethodId(110))));
    }

    #[test]
    fn test_interface_without_bound_is_constrained_profiled_guard() {
        let options = JitOptions::default();
        let h = hierarchy(&options);
        let mut ledger = AssumptionLedger::new();
        let site = CallSite::interface_call(ClassId(10), AREA);
        let selection = GuardSelector::new(&h, &options).select(&site, &ClassProfile::new(), &mut ledger).unwrap();

        assert_eq!(
            selection.guard.kind,
            GuardKind::Profiled {
                class: ClassId(11),
                method: MethodId(110),
                required_type: Some(ClassId(10))
            }
        );
        assert!(!ledger.uses_preexistence());
    }

    #[test]
    fn test_abstract_guard() {
        let options = JitOptions::default();
        let h = hierarchy(&options);
        let mut ledger = AssumptionLedger::new();
        let selection = GuardSelector::new(&h, &options)
            .select(&CallSite::virtual_call(ClassId(2), SPEAK), &ClassProfile::new(), &mut ledger)
            .unwrap();
        assert!(matches!(selection.guard.kind, GuardKind::Abstract { class: ClassId(2), .. }));
        assert_eq!(selection.target, MethodId(30));
        assert_eq!(ledger.classes_not_newly_extended(), &[ClassId(2), ClassId(3), ClassId(4)]);
    }

    fn two_dogs(h: &mut ClassHierarchy) {
        h.class_loaded(
            ClassDescriptor::new(ClassId(6), "Cat").extends(ClassId(2)).method(MethodId(60), SPEAK),
            &NoClassSource,
        )
        .unwrap();
    }

    #[test]
    fn test_profiled_extended_class_uses_method_test() {
        let options = JitOptions::default();
        let mut h = hierarchy(&options);
        two_dogs(&mut h);
        let mut ledger = AssumptionLedger::new();
        let site = CallSite::virtual_call(ClassId(2), SPEAK);
        let profile = ClassProfile::new().with(ClassId(3), 20).with(ClassId(6), 5);
        let selection = GuardSelector::new(&h, &options).select(&site, &profile, &mut ledger).unwrap();
        assert!(matches!(selection.guard.kind, GuardKind::Profiled { class: ClassId(3), .. }));
        assert_eq!(selection.guard.test_type, TestType::MethodTest);
    }

    #[test]
    fn test_profiled_single_class_reverts_to_vft() {
        let options = JitOptions::default();
        let mut h = hierarchy(&options);
        two_dogs(&mut h);
        let mut ledger = AssumptionLedger::new();
        let site = CallSite::virtual_call(ClassId(2), SPEAK);
        // Logger samples are non-conforming and filtered away
        let profile = ClassProfile::new().with(ClassId(3), 40).with(ClassId(30), 10);
        let selection = GuardSelector::new(&h, &options).select(&site, &profile, &mut ledger).unwrap();
        assert_eq!(selection.guard.test_type, TestType::VftTest);

        let few = ClassProfile::new().with(ClassId(3), 10);
        let selection = GuardSelector::new(&h, &options).select(&site, &few, &mut ledger).unwrap();
        assert_eq!(selection.guard.test_type, TestType::MethodTest);
    }

    #[test]
    fn test_profiled_not_extended_is_cheap_vft_bet() {
        let options = JitOptions::default();
        let mut h = hierarchy(&options);
        two_dogs(&mut h);
        let mut ledger = AssumptionLedger::new();
        let site = CallSite::virtual_call(ClassId(2), SPEAK);
        let profile = ClassProfile::new().with(ClassId(6), 7).with(ClassId(3), 3);
        let selection = GuardSelector::new(&h, &options).select(&site, &profile, &mut ledger).unwrap();
        assert!(matches!(selection.guard.kind, GuardKind::Profiled { class: ClassId(6), .. }));
        assert_eq!(selection.guard.test_type, TestType::VftTest);
    }

    #[test]
    fn test_profiled_below_threshold_and_obsolete() {
        let options = JitOptions::default();
        let mut h = hierarchy(&options);
        two_dogs(&mut h);
        let mut ledger = AssumptionLedger::new();
        let site = CallSite::virtual_call(ClassId(2), SPEAK);
        let cold = ClassProfile::new().with(ClassId(3), 1).with(ClassId(30), 99);
        assert!(GuardSelector::new(&h, &options).select(&site, &cold, &mut ledger).is_none());

        h.class_unloaded(ClassId(6)).unwrap();
        let stale = ClassProfile::new().with(ClassId(6), 90).with(ClassId(3), 10);
        let selection = GuardSelector::new(&h, &options).select(&site, &stale, &mut ledger).unwrap();
        // Cat is gone and Dog is now the only implementer again
        assert!(matches!(selection.guard.kind, GuardKind::Abstract { .. }));
    }

    #[test]
    fn test_final_class_profile() {
        let options = JitOptions {
            disable_ch_opts: true,
            ..JitOptions::default()
        };
        let h = hierarchy(&options);
        let mut ledger = AssumptionLedger::new();
        let site = CallSite::virtual_call(ClassId(20), SPEAK);
        let profile = ClassProfile::new().with(ClassId(20), 3);
        let selection = GuardSelector::new(&h, &options).select(&site, &profile, &mut ledger).unwrap();
        assert!(matches!(selection.guard.kind, GuardKind::Profiled { class: ClassId(20), .. }));
        assert_eq!(selection.guard.test_type, TestType::VftTest);
        assert!(ledger.is_empty());
    }
}
