//! Commit: validate a compilation's facts, register its assumptions, install its body
//!
//! Runs with the runtime lock held, so no hierarchy event can land between
//! validation and installation. The steps are:
//!
//! 1. cleanup: withdraw the slot's not-newly-extended promises, whatever the outcome
//! 2. validate every ledger fact against the live hierarchy
//! 3. register one assumption per (fact, guard site), then the OSR and
//!    per-kind guard assumptions, then the side-effect and native call sites
//! 4. install the body
//!
//! Any failure discards the body together with whatever it registered.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::assumptions::{AssumptionAction, AssumptionKind, AssumptionTable, PatchPair, SubjectKey};
use crate::code::{CodeBody, CodeCache, PatchOutcome, PatchTarget};
use crate::config::JitOptions;
use crate::guard::{GuardKind, GuardSite, TestType, VirtualGuard};
use crate::hierarchy::ClassHierarchy;
use crate::ids::{BodyId, ClassId, CodeAddress, CompileThreadSlot, MethodId};
use crate::ledger::{AssumptionLedger, Fact};
use crate::runtime::{RuntimeState, VmFacts};

/// Why a compilation's body was thrown away
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("a class loaded during compilation broke a not-newly-extended promise of slot {0}")]
    SlotPoisoned(CompileThreadSlot),

    #[error("method {0} is now overridden")]
    MethodOverridden(MethodId),

    #[error("class {0} is now extended")]
    ClassExtended(ClassId),

    #[error("class {class} gained subclass {subclass}")]
    ClassNewlyExtended { class: ClassId, subclass: ClassId },

    #[error("a static final field of class {0} was modified")]
    StaticFinalModified(ClassId),

    #[error("body {0} is not in the code cache")]
    MissingBody(BodyId),
}

impl CommitError {
    /// The ledger fact that stopped holding, if the failure was one
    pub fn fact(&self) -> Option<Fact> {
        match self {
            CommitError::MethodOverridden(m) => Some(Fact::MethodNotOverridden(*m)),
            CommitError::ClassExtended(c) => Some(Fact::ClassNotExtended(*c)),
            CommitError::ClassNewlyExtended { class, .. } => Some(Fact::ClassNotNewlyExtended(*class)),
            _ => None,
        }
    }
}

/// What a successful commit left behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    pub body: BodyId,
    /// Assumptions registered, pre-existence ones included
    pub registered: usize,
    /// Facts no guard site covers; firing one recompiles the body
    pub preexistence: usize,
    /// Guard sites patched at commit because the guard was already stale
    pub compensated: usize,
}

/// Withdraw `slot`'s not-newly-extended promises. Safe to repeat.
pub fn release_promises(hierarchy: &mut ClassHierarchy, slot: CompileThreadSlot, ledger: &AssumptionLedger) {
    let guarded = ledger.guard_facts().filter_map(|fact| match fact {
        Fact::ClassNotNewlyExtended(class) => Some(class),
        _ => None,
    });
    for class in ledger.classes_not_newly_extended().iter().copied().chain(guarded) {
        hierarchy.clear_should_not_be_newly_extended(class, slot);
    }
}

/// Validate, register and install. The caller must hold the runtime lock.
pub fn commit_body(
    state: &mut RuntimeState,
    options: &JitOptions,
    slot: CompileThreadSlot,
    body: BodyId,
    ledger: &AssumptionLedger,
) -> Result<CommitSummary, CommitError> {
    release_promises(&mut state.hierarchy, slot, ledger);
    let poisoned = state.hierarchy.slot_failed(slot);
    state.hierarchy.reset_slot(slot);

    let outcome = if poisoned {
        Err(CommitError::SlotPoisoned(slot))
    } else if !ledger.needs_validation() {
        Ok(CommitSummary {
            body,
            registered: 0,
            preexistence: 0,
            compensated: 0,
        })
    } else {
        validate(&state.hierarchy, &state.vm, ledger).and_then(|()| register(state, options, body, ledger))
    };

    let outcome = outcome.and_then(|summary| {
        state.code.install(body).map_err(|_| CommitError::MissingBody(body))?;
        Ok(summary)
    });

    match &outcome {
        Ok(summary) => info!(
            %body,
            registered = summary.registered,
            preexistence = summary.preexistence,
            compensated = summary.compensated,
            "body committed"
        ),
        Err(e) => {
            let reclaimed = state.assumptions.discard_body(body);
            state.code.discard(body);
            info!(%body, error = %e, reclaimed, "commit failed, body discarded");
        }
    }
    outcome
}

/// Boolean form of [`commit_body`]
pub fn commit(
    state: &mut RuntimeState,
    options: &JitOptions,
    slot: CompileThreadSlot,
    body: BodyId,
    ledger: &AssumptionLedger,
) -> bool {
    commit_body(state, options, slot, body, ledger).is_ok()
}

/// Re-check every recorded fact, and every fact a guard leans on, against the live hierarchy
pub fn validate(hierarchy: &ClassHierarchy, vm: &VmFacts, ledger: &AssumptionLedger) -> Result<(), CommitError> {
    let facts: Vec<Fact> = ledger.facts().chain(ledger.guard_facts()).collect();
    let promised: FxHashSet<ClassId> = facts
        .iter()
        .filter_map(|fact| match fact {
            Fact::ClassNotNewlyExtended(class) => Some(*class),
            _ => None,
        })
        .collect();

    for fact in facts {
        match fact {
            Fact::MethodNotOverridden(method) => {
                if hierarchy.method_is_overridden(method) {
                    return Err(CommitError::MethodOverridden(method));
                }
            }
            Fact::ClassNotExtended(class) => {
                if hierarchy.class_has_been_extended(class) {
                    return Err(CommitError::ClassExtended(class));
                }
            }
            // an extended class is fine as long as every subclass was promised too
            Fact::ClassNotNewlyExtended(class) => {
                let Some(node) = hierarchy.find_class_info(class) else {
                    continue;
                };
                if !node.has_been_extended() {
                    continue;
                }
                if let Some(&subclass) = node.subclasses().iter().find(|s| !promised.contains(s)) {
                    return Err(CommitError::ClassNewlyExtended { class, subclass });
                }
            }
        }
    }

    for &class in ledger.classes_for_static_final_field_modification() {
        if vm.static_final_modified(class) {
            return Err(CommitError::StaticFinalModified(class));
        }
    }
    Ok(())
}

/// Registration bookkeeping for one body
struct Registrar<'a> {
    table: &'a mut AssumptionTable,
    code: &'a CodeCache,
    body: &'a CodeBody,
    seen: FxHashSet<(AssumptionKind, SubjectKey, CodeAddress)>,
    summary: CommitSummary,
}

impl Registrar<'_> {
    fn pair(&self, site: &GuardSite) -> PatchPair {
        PatchPair {
            location: self.body.address_of(site.location),
            destination: self.body.address_of(site.destination),
        }
    }

    fn add(&mut self, kind: AssumptionKind, subject: SubjectKey, location: CodeAddress, action: AssumptionAction) {
        if !self.seen.insert((kind, subject, location)) {
            return;
        }
        self.table.register(kind, subject, self.body.id(), action);
        self.summary.registered += 1;
    }

    fn at_sites(&mut self, kind: AssumptionKind, subject: SubjectKey, sites: &[GuardSite]) {
        for site in sites {
            let pair = self.pair(site);
            self.add(kind, subject, pair.location, AssumptionAction::PatchSite(pair));
        }
    }

    fn shared(&mut self, kind: AssumptionKind, subject: SubjectKey, pairs: &Arc<[PatchPair]>) {
        if let Some(first) = pairs.first() {
            self.add(kind, subject, first.location, AssumptionAction::PatchSites(Arc::clone(pairs)));
        }
    }

    fn recompile(&mut self, kind: AssumptionKind, subject: SubjectKey) {
        let entry = self.body.entry();
        let before = self.summary.registered;
        self.add(
            kind,
            subject,
            entry,
            AssumptionAction::Recompile {
                entry,
                helper: self.code.recompile_helper(),
            },
        );
        self.summary.preexistence += self.summary.registered - before;
    }

    /// Take the slow path right away
    fn compensate(&mut self, guard: &VirtualGuard, sites: &[GuardSite]) {
        for site in sites {
            let pair = self.pair(site);
            match self.code.patch(pair.location, pair.destination) {
                Ok(PatchOutcome::Patched) => self.summary.compensated += 1,
                Ok(PatchOutcome::AlreadyPatched) => {}
                Err(e) => warn!(%guard, error = %e, "compensating patch failed"),
            }
        }
        debug!(%guard, "guard stale at commit, sites patched");
    }

    fn fact_at_sites(&mut self, hierarchy: &ClassHierarchy, fact: Fact, sites: &[GuardSite]) {
        match fact {
            Fact::ClassNotExtended(class) => self.at_sites(AssumptionKind::OnClassExtend, SubjectKey::Class(class), sites),
            Fact::ClassNotNewlyExtended(class) => {
                for sub in hierarchy.subtree(class) {
                    self.at_sites(AssumptionKind::OnClassExtend, SubjectKey::Class(sub), sites);
                }
            }
            Fact::MethodNotOverridden(method) => {
                self.at_sites(AssumptionKind::OnMethodOverride, SubjectKey::Method(method), sites)
            }
        }
    }

    fn preexistence(&mut self, fact: Fact) {
        match fact {
            Fact::ClassNotExtended(class) | Fact::ClassNotNewlyExtended(class) => {
                self.recompile(AssumptionKind::OnClassExtend, SubjectKey::Class(class))
            }
            Fact::MethodNotOverridden(method) => {
                self.recompile(AssumptionKind::OnMethodOverride, SubjectKey::Method(method))
            }
        }
    }

    /// Register on-class-extend if `class` is still a leaf
    fn class_unextended(&mut self, hierarchy: &ClassHierarchy, class: ClassId, sites: &[GuardSite]) -> bool {
        if hierarchy.class_has_been_extended(class) {
            return false;
        }
        self.at_sites(AssumptionKind::OnClassExtend, SubjectKey::Class(class), sites);
        true
    }

    fn subtree_unextended(&mut self, hierarchy: &ClassHierarchy, top: ClassId, sites: &[GuardSite]) {
        for sub in hierarchy.subtree(top) {
            self.at_sites(AssumptionKind::OnClassExtend, SubjectKey::Class(sub), sites);
        }
    }
}

fn register(
    state: &mut RuntimeState,
    options: &JitOptions,
    body: BodyId,
    ledger: &AssumptionLedger,
) -> Result<CommitSummary, CommitError> {
    let code_body = state.code.body(body).cloned().ok_or(CommitError::MissingBody(body))?;
    let RuntimeState {
        hierarchy,
        assumptions,
        code,
        vm,
    } = state;
    let mut r = Registrar {
        table: assumptions,
        code,
        body: &code_body,
        seen: FxHashSet::default(),
        summary: CommitSummary {
            body,
            registered: 0,
            preexistence: 0,
            compensated: 0,
        },
    };

    // facts a guard leans on patch that guard's sites; inner guards share the outer sites
    let mut covered = FxHashSet::default();
    for guard in ledger.guards() {
        for g in guard.flatten() {
            for &fact in &g.assumes {
                covered.insert(fact);
                r.fact_at_sites(hierarchy, fact, &guard.sites);
            }
        }
    }
    for fact in ledger.facts() {
        if !covered.contains(&fact) {
            r.preexistence(fact);
        }
    }

    commit_osr(&mut r, options, ledger);

    for guard in ledger.guards().iter().filter(|g| !g.sites.is_empty()) {
        for g in guard.flatten() {
            commit_guard(&mut r, hierarchy, vm, options, g, &guard.sites);
        }
    }

    for site in ledger.side_effect_sites() {
        for &class in ledger.classes_not_extended().iter().chain(ledger.classes_not_newly_extended()) {
            r.at_sites(AssumptionKind::OnClassExtend, SubjectKey::Class(class), std::slice::from_ref(site));
        }
    }

    for &(method, label) in ledger.native_call_sites() {
        let location = r.body.address_of(label);
        r.add(
            AssumptionKind::OnRegisterNative,
            SubjectKey::Method(method),
            location,
            AssumptionAction::PatchNativeCall { location },
        );
    }

    Ok(r.summary)
}

/// OSR transition points are patched when a class the compilation folded
/// in is redefined or one of its static finals changes
fn commit_osr(r: &mut Registrar<'_>, options: &JitOptions, ledger: &AssumptionLedger) {
    let mut sites: Vec<GuardSite> = Vec::new();
    for guard in ledger.guards() {
        if guard.flatten().iter().any(|g| g.is_osr()) {
            for site in &guard.sites {
                if !sites.contains(site) {
                    sites.push(*site);
                }
            }
        }
    }
    let redefinition = ledger.classes_for_osr_redefinition();
    let statics = ledger.classes_for_static_final_field_modification();
    if sites.is_empty() || (redefinition.is_empty() && statics.is_empty()) {
        return;
    }

    let targets: Vec<(AssumptionKind, ClassId)> = redefinition
        .iter()
        .map(|c| (AssumptionKind::OnClassRedefinition, *c))
        .chain(statics.iter().map(|c| (AssumptionKind::OnStaticFinalFieldModification, *c)))
        .collect();

    if sites.len() == 1 || !options.group_osr_assumptions {
        for (kind, class) in targets {
            r.at_sites(kind, SubjectKey::Class(class), &sites);
        }
    } else {
        let pairs: Arc<[PatchPair]> = sites.iter().map(|s| r.pair(s)).collect();
        for (kind, class) in targets {
            r.shared(kind, SubjectKey::Class(class), &pairs);
        }
        debug!(sites = pairs.len(), "OSR sites grouped");
    }
}

/// Register what one guard kind needs, or patch its sites when its own fact is already gone
fn commit_guard(
    r: &mut Registrar<'_>,
    hierarchy: &ClassHierarchy,
    vm: &VmFacts,
    options: &JitOptions,
    guard: &VirtualGuard,
    sites: &[GuardSite],
) {
    if let Some(class) = guard.merged_with_hcr {
        r.at_sites(AssumptionKind::OnClassRedefinition, SubjectKey::Class(class), sites);
    }

    let valid = match &guard.kind {
        GuardKind::Hcr { class } => {
            r.at_sites(AssumptionKind::OnClassRedefinition, SubjectKey::Class(*class), sites);
            true
        }
        GuardKind::Osr | GuardKind::Dummy | GuardKind::DirectMethod { .. } | GuardKind::Profiled { .. } => true,
        GuardKind::MutableCallSite { cookie, epoch } => {
            if !options.invalidate_mutable_call_site_guards {
                true
            } else if vm.call_site_epoch(*cookie) == *epoch {
                r.at_sites(AssumptionKind::OnMutableCallSiteChange, SubjectKey::Cookie(*cookie), sites);
                true
            } else {
                false
            }
        }
        GuardKind::Breakpoint { method } => {
            if options.nop_breakpoint_guards {
                r.at_sites(AssumptionKind::OnMethodBreakpoint, SubjectKey::Method(*method), sites);
                !vm.is_breakpointed(*method)
            } else {
                true
            }
        }
        GuardKind::ArrayStoreCheck { class } => r.class_unextended(hierarchy, *class, sites),
        GuardKind::Interface { class, selector } => match hierarchy.find_single_implementer(*class, selector) {
            Some(target) => {
                let owner = hierarchy.method(target).map(|m| m.owner);
                let vft_stale = guard.test_type == TestType::VftTest
                    && owner.map_or(true, |o| hierarchy.class_has_been_extended(o));
                if !vft_stale {
                    r.subtree_unextended(hierarchy, *class, sites);
                }
                !vft_stale
            }
            None => false,
        },
        GuardKind::Abstract { class, selector } => match hierarchy.find_single_abstract_implementer(*class, selector) {
            Some(_) => {
                r.subtree_unextended(hierarchy, *class, sites);
                true
            }
            None => false,
        },
        GuardKind::NonOverridden { class, method } | GuardKind::Hierarchy { class, method } => {
            if guard.test_type == TestType::VftTest {
                r.class_unextended(hierarchy, *class, sites)
            } else {
                let broken = match guard.kind {
                    GuardKind::Hierarchy { .. } => hierarchy.is_overridden_in_this_hierarchy(*method, *class),
                    _ => hierarchy.method_is_overridden(*method),
                };
                if !broken {
                    r.at_sites(AssumptionKind::OnMethodOverride, SubjectKey::Method(*method), sites);
                }
                !broken
            }
        }
    };

    if !valid {
        r.compensate(guard, sites);
    }
}
