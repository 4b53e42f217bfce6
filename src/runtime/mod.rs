//! Shared JIT runtime state and per-compilation handles
//!
//! [`JitRuntime`] owns the class hierarchy, the assumption table and the
//! code cache behind one global lock. Holding the [`MutexGuard`] returned by
//! [`JitRuntime::lock`] is the "already locked" state: everything on
//! [`RuntimeState`] assumes it, so a thread that is committing can feed
//! events or query the hierarchy without re-entering the lock.
//!
//! A [`Compilation`] owns a compile-thread slot, a ledger and a code buffer.
//! Dropping it without committing is an abort: the slot's promises are
//! withdrawn and nothing is ever registered.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::assumptions::{AssumptionKind, AssumptionStats, AssumptionTable, NotifyReport, SubjectKey};
use crate::casts::{CastPlan, CastRequest, CastTestPlanner};
use crate::code::{CodeBuffer, CodeCache, SiteLabel};
use crate::commit::{self, CommitError, CommitSummary};
use crate::config::JitOptions;
use crate::error::{Error, Result};
use crate::guard::{GuardSite, VirtualGuard};
use crate::hierarchy::{ClassDescriptor, ClassHierarchy, ClassSource, HierarchyEvent, NoClassSource};
use crate::ids::{BodyId, ClassId, CodeAddress, CompileThreadSlot, MethodId};
use crate::ledger::{AssumptionLedger, Fact, ResolvedMethod};
use crate::profile::ClassProfile;
use crate::selector::{CallSite, GuardSelector, Selection};

/// VM facts that are not part of the class hierarchy
#[derive(Debug, Default)]
pub struct VmFacts {
    call_site_epochs: FxHashMap<u64, u64>,
    breakpointed: FxHashSet<MethodId>,
    modified_static_finals: FxHashSet<ClassId>,
}

impl VmFacts {
    /// Current target epoch of a mutable call site; 0 until it first changes
    pub fn call_site_epoch(&self, cookie: u64) -> u64 {
        self.call_site_epochs.get(&cookie).copied().unwrap_or(0)
    }

    pub fn bump_call_site(&mut self, cookie: u64) -> u64 {
        let epoch = self.call_site_epochs.entry(cookie).or_insert(0);
        *epoch += 1;
        *epoch
    }

    pub fn is_breakpointed(&self, method: MethodId) -> bool {
        self.breakpointed.contains(&method)
    }

    pub fn set_breakpoint(&mut self, method: MethodId) {
        self.breakpointed.insert(method);
    }

    pub fn static_final_modified(&self, class: ClassId) -> bool {
        self.modified_static_finals.contains(&class)
    }

    pub fn modify_static_final(&mut self, class: ClassId) {
        self.modified_static_finals.insert(class);
    }
}

/// Something the class loader or VM reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeEvent {
    ClassLoaded { class: ClassDescriptor },
    ClassExtended { superclass: ClassId, subclass: ClassId },
    ClassInitialized { class: ClassId },
    ClassRedefined { old: ClassId, new: ClassId },
    ClassUnloaded { class: ClassId },
    MethodOverridden { method: MethodId },
    StaticFinalFieldModified { class: ClassId },
    MethodBreakpointed { method: MethodId },
    MutableCallSiteChanged { cookie: u64 },
    NativeRegistered { method: MethodId, address: CodeAddress },
    BodyDiscarded { body: BodyId },
}

/// Everything the global lock protects
#[derive(Debug)]
pub struct RuntimeState {
    pub hierarchy: ClassHierarchy,
    pub assumptions: AssumptionTable,
    pub code: CodeCache,
    pub vm: VmFacts,
}

impl RuntimeState {
    pub fn new(options: &JitOptions) -> Self {
        Self {
            hierarchy: ClassHierarchy::new(options),
            assumptions: AssumptionTable::new(),
            code: CodeCache::new(),
            vm: VmFacts::default(),
        }
    }

    /// Fire `(kind, subject)` and mark the bodies it invalidated
    pub fn notify(&mut self, kind: AssumptionKind, subject: SubjectKey, destination: Option<CodeAddress>) -> NotifyReport {
        let report = self.assumptions.notify(kind, subject, &self.code, destination);
        for body in &report.invalidated {
            if let Some(b) = self.code.body(*body) {
                b.mark_invalidated();
                debug!(%body, "body invalidated");
            }
        }
        report
    }

    /// Turn registry events into assumption notifications
    pub fn dispatch(&mut self, events: &[HierarchyEvent]) -> NotifyReport {
        let mut report = NotifyReport::default();
        for event in events {
            let fired = match event {
                HierarchyEvent::ClassExtended { superclass, .. } => {
                    self.notify(AssumptionKind::OnClassExtend, SubjectKey::Class(*superclass), None)
                }
                HierarchyEvent::MethodOverridden { method, .. } => {
                    self.notify(AssumptionKind::OnMethodOverride, SubjectKey::Method(*method), None)
                }
                HierarchyEvent::ClassRedefined { old, .. } => {
                    self.notify(AssumptionKind::OnClassRedefinition, SubjectKey::Class(*old), None)
                }
                HierarchyEvent::ClassLoaded(_) | HierarchyEvent::ClassInitialized(_) | HierarchyEvent::ClassUnloaded(_) => {
                    continue
                }
            };
            report.merge(fired);
        }
        report
    }

    pub fn load_class(&mut self, descriptor: ClassDescriptor, source: &dyn ClassSource) -> Result<NotifyReport> {
        let events = self.hierarchy.class_loaded(descriptor, source)?;
        Ok(self.dispatch(&events))
    }

    pub fn apply(&mut self, event: RuntimeEvent) -> Result<NotifyReport> {
        trace!(?event, "runtime event");
        let report = match event {
            RuntimeEvent::ClassLoaded { class } => self.load_class(class, &NoClassSource)?,
            RuntimeEvent::ClassExtended { superclass, subclass } => {
                let events = self.hierarchy.class_extended(superclass, subclass)?;
                self.dispatch(&events)
            }
            RuntimeEvent::ClassInitialized { class } => {
                self.hierarchy.class_initialized(class)?;
                NotifyReport::default()
            }
            RuntimeEvent::ClassRedefined { old, new } => {
                let events = self.hierarchy.class_redefined(old, new)?;
                self.dispatch(&events)
            }
            RuntimeEvent::ClassUnloaded { class } => {
                self.hierarchy.class_unloaded(class)?;
                NotifyReport::default()
            }
            RuntimeEvent::MethodOverridden { method } => {
                let events = self.hierarchy.method_overridden(method)?;
                self.dispatch(&events)
            }
            RuntimeEvent::StaticFinalFieldModified { class } => {
                self.vm.modify_static_final(class);
                self.notify(AssumptionKind::OnStaticFinalFieldModification, SubjectKey::Class(class), None)
            }
            RuntimeEvent::MethodBreakpointed { method } => {
                self.vm.set_breakpoint(method);
                self.notify(AssumptionKind::OnMethodBreakpoint, SubjectKey::Method(method), None)
            }
            RuntimeEvent::MutableCallSiteChanged { cookie } => {
                self.vm.bump_call_site(cookie);
                self.notify(AssumptionKind::OnMutableCallSiteChange, SubjectKey::Cookie(cookie), None)
            }
            RuntimeEvent::NativeRegistered { method, address } => {
                self.notify(AssumptionKind::OnRegisterNative, SubjectKey::Method(method), Some(address))
            }
            RuntimeEvent::BodyDiscarded { body } => {
                self.discard_body(body);
                NotifyReport::default()
            }
        };
        if report.fired > 0 {
            info!(fired = report.fired, patched = report.patched, invalidated = report.invalidated.len(), "event handled");
        }
        Ok(report)
    }

    /// Reclaim a body's assumptions and drop it from the cache
    pub fn discard_body(&mut self, body: BodyId) -> usize {
        let reclaimed = self.assumptions.discard_body(body);
        if let Some(b) = self.code.discard(body) {
            if let Some(method) = b.method() {
                self.hierarchy.set_method_compiled(method, false);
            }
        }
        reclaimed
    }
}

/// Process-wide JIT state
#[derive(Debug)]
pub struct JitRuntime {
    options: JitOptions,
    state: Mutex<RuntimeState>,
    /// Bit per compile-thread slot in use
    slots: Mutex<u32>,
}

impl JitRuntime {
    pub fn new(options: JitOptions) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RuntimeState::new(&options)),
            slots: Mutex::new(0),
            options,
        })
    }

    pub fn options(&self) -> &JitOptions {
        &self.options
    }

    /// Take the global class-table lock
    pub fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock()
    }

    pub fn load_class(&self, descriptor: ClassDescriptor, source: &dyn ClassSource) -> Result<NotifyReport> {
        self.lock().load_class(descriptor, source)
    }

    /// Entry point for loader and VM events
    pub fn handle_event(&self, event: RuntimeEvent) -> Result<NotifyReport> {
        self.lock().apply(event)
    }

    pub fn stats(&self) -> AssumptionStats {
        self.lock().assumptions.stats().clone()
    }

    /// Slots currently held by live compilations
    pub fn active_compilations(&self) -> u32 {
        self.slots.lock().count_ones()
    }

    fn acquire_slot(&self) -> Result<CompileThreadSlot> {
        let mut slots = self.slots.lock();
        let max = self.options.max_compile_threads;
        let free = (0..max).find(|i| *slots & (1 << i) == 0).ok_or(Error::NoCompileSlot(max))?;
        *slots |= 1 << free;
        Ok(CompileThreadSlot(free as u8))
    }

    fn release_slot(&self, slot: CompileThreadSlot) {
        *self.slots.lock() &= !slot.mask();
    }

    /// Start compiling `method` on a free compile-thread slot
    pub fn begin_compilation(self: &Arc<Self>, method: Option<MethodId>) -> Result<Compilation> {
        let slot = self.acquire_slot()?;
        debug!(%slot, method = ?method, "compilation started");
        Ok(Compilation {
            runtime: Arc::clone(self),
            slot,
            method,
            ledger: AssumptionLedger::new(),
            buffer: CodeBuffer::new(),
        })
    }
}

/// One in-flight compilation
pub struct Compilation {
    runtime: Arc<JitRuntime>,
    slot: CompileThreadSlot,
    method: Option<MethodId>,
    ledger: AssumptionLedger,
    buffer: CodeBuffer,
}

impl Compilation {
    pub fn slot(&self) -> CompileThreadSlot {
        self.slot
    }

    pub fn method(&self) -> Option<MethodId> {
        self.method
    }

    pub fn ledger(&self) -> &AssumptionLedger {
        &self.ledger
    }

    pub fn buffer_mut(&mut self) -> &mut CodeBuffer {
        &mut self.buffer
    }

    pub fn record_class_not_extended(&mut self, class: ClassId) -> bool {
        self.ledger.record_class_not_extended(class)
    }

    /// Also raises this slot's bit on the class so a concurrent load is noticed
    pub fn record_class_not_newly_extended(&mut self, class: ClassId) -> bool {
        let added = self.ledger.record_class_not_newly_extended(class);
        if added {
            self.runtime.lock().hierarchy.set_should_not_be_newly_extended(class, self.slot);
        }
        added
    }

    pub fn record_method_not_overridden(&mut self, method: MethodId) -> Result<bool> {
        let resolved = {
            let state = self.runtime.lock();
            let info = state.hierarchy.method(method).ok_or_else(|| Error::unknown_method(method))?;
            ResolvedMethod {
                id: info.id,
                owner: info.owner,
                selector: info.selector.clone(),
            }
        };
        Ok(self.ledger.record_method_not_overridden(resolved))
    }

    pub fn record_osr_redefinition_class(&mut self, class: ClassId) -> bool {
        self.ledger.record_osr_redefinition_class(class)
    }

    pub fn record_static_final_field_class(&mut self, class: ClassId) -> bool {
        self.ledger.record_static_final_field_class(class)
    }

    /// Record `fact` through the matching `record_*` call
    pub fn record_fact(&mut self, fact: Fact) -> Result<bool> {
        match fact {
            Fact::ClassNotExtended(class) => Ok(self.record_class_not_extended(class)),
            Fact::ClassNotNewlyExtended(class) => Ok(self.record_class_not_newly_extended(class)),
            Fact::MethodNotOverridden(method) => self.record_method_not_overridden(method),
        }
    }

    /// Emit a call to a native method whose implementation is not bound yet;
    /// registering the native re-points the call
    pub fn add_native_call_site(&mut self, method: MethodId) -> SiteLabel {
        let location = self.buffer.emit_patchable_site();
        self.ledger.record_native_call_site(method, location);
        location
    }

    fn emit_site(&mut self) -> GuardSite {
        let location = self.buffer.emit_patchable_site();
        let destination = self.buffer.emit_deopt_stub();
        GuardSite { location, destination }
    }

    /// Add a guard and record every fact it and its inner guards assume;
    /// a NOP-able guard without sites gets one emitted
    pub fn add_guard(&mut self, mut guard: VirtualGuard) -> Result<usize> {
        let assumed: Vec<Fact> = guard.flatten().iter().flat_map(|g| g.assumes.iter().copied()).collect();
        for fact in assumed {
            self.record_fact(fact)?;
        }
        if guard.kind.is_nopable() && guard.sites.is_empty() {
            guard.add_site(self.emit_site());
        }
        Ok(self.ledger.add_guard(guard))
    }

    /// Run the guard selector for `site` and emit the chosen guard
    pub fn select_guard(&mut self, site: &CallSite, profile: &ClassProfile) -> Option<Selection> {
        let runtime = Arc::clone(&self.runtime);
        let mut selection = {
            let state = runtime.lock();
            GuardSelector::new(&state.hierarchy, runtime.options()).select(site, profile, &mut self.ledger)?
        };
        if selection.guard.kind.is_nopable() {
            selection.guard.add_site(self.emit_site());
        }
        // the selector may have promised whole subtrees
        {
            let mut state = runtime.lock();
            for &class in self.ledger.classes_not_newly_extended() {
                state.hierarchy.set_should_not_be_newly_extended(class, self.slot);
            }
        }
        self.ledger.add_guard(selection.guard.clone());
        Some(selection)
    }

    /// A site patched for its side effect only
    pub fn add_side_effect_site(&mut self) -> GuardSite {
        let site = self.emit_site();
        self.ledger.add_side_effect_site(site);
        site
    }

    pub fn plan_cast(&self, request: &CastRequest) -> CastPlan {
        let state = self.runtime.lock();
        CastTestPlanner::new(&state.hierarchy, self.runtime.options()).plan(request)
    }

    /// Place the body, then validate, register and install it atomically
    pub fn commit(mut self) -> std::result::Result<CommitSummary, CommitError> {
        let runtime = Arc::clone(&self.runtime);
        let buffer = std::mem::take(&mut self.buffer);
        let mut state = runtime.lock();
        let body = state.code.allocate(buffer, self.method).id();
        let summary = commit::commit_body(&mut state, runtime.options(), self.slot, body, &self.ledger)?;
        if let Some(method) = self.method {
            state.hierarchy.set_method_compiled(method, true);
        }
        Ok(summary)
    }

    /// Give up; nothing is registered
    pub fn abort(self) {
        debug!(slot = %self.slot, facts = self.ledger.fact_count(), "compilation aborted");
    }
}

impl Drop for Compilation {
    fn drop(&mut self) {
        {
            let mut state = self.runtime.lock();
            commit::release_promises(&mut state.hierarchy, self.slot, &self.ledger);
            state.hierarchy.reset_slot(self.slot);
        }
        self.runtime.release_slot(self.slot);
    }
}
