//! Per-compilation assumption ledger
//!
//! Scratch bookkeeping for one compilation: the hierarchy facts it relied
//! on, the guards it emitted and the side-effect sites it wants patched.
//! A ledger never outlives its compilation; aborting simply drops it.

use std::fmt;

use crate::code::SiteLabel;
use crate::guard::{GuardSite, VirtualGuard};
use crate::ids::{ClassId, MethodId, Selector};

/// A hierarchy fact a compilation may rely on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fact {
    /// The class has no subclass at all
    ClassNotExtended(ClassId),
    /// No subclass beyond those present at compile time will appear
    ClassNotNewlyExtended(ClassId),
    /// No loaded class overrides the method
    MethodNotOverridden(MethodId),
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fact::ClassNotExtended(c) => write!(f, "class {} not extended", c),
            Fact::ClassNotNewlyExtended(c) => write!(f, "class {} not newly extended", c),
            Fact::MethodNotOverridden(m) => write!(f, "method {} not overridden", m),
        }
    }
}

/// The compiler's view of a resolved method. Several wrappers may exist for
/// one method; the ledger only cares about the persistent `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMethod {
    pub id: MethodId,
    pub owner: ClassId,
    pub selector: Selector,
}

#[derive(Debug, Default)]
pub struct AssumptionLedger {
    classes_not_extended: Vec<ClassId>,
    classes_not_newly_extended: Vec<ClassId>,
    methods_not_overridden: Vec<ResolvedMethod>,
    classes_for_osr_redefinition: Vec<ClassId>,
    classes_for_static_final_field_modification: Vec<ClassId>,
    guards: Vec<VirtualGuard>,
    side_effect_sites: Vec<GuardSite>,
    /// Call sites of native methods not yet bound
    native_call_sites: Vec<(MethodId, SiteLabel)>,
    uses_preexistence: bool,
}

fn insert_unique<T: PartialEq>(list: &mut Vec<T>, item: T) -> bool {
    if list.contains(&item) {
        return false;
    }
    list.push(item);
    true
}

impl AssumptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the class was newly recorded
    pub fn record_class_not_extended(&mut self, class: ClassId) -> bool {
        let added = insert_unique(&mut self.classes_not_extended, class);
        self.uses_preexistence |= added;
        added
    }

    pub fn record_class_not_newly_extended(&mut self, class: ClassId) -> bool {
        let added = insert_unique(&mut self.classes_not_newly_extended, class);
        self.uses_preexistence |= added;
        added
    }

    pub fn record_method_not_overridden(&mut self, method: ResolvedMethod) -> bool {
        if self.methods_not_overridden.iter().any(|m| m.id == method.id) {
            return false;
        }
        self.methods_not_overridden.push(method);
        self.uses_preexistence = true;
        true
    }

    /// Classes whose redefinition must patch the OSR sites
    pub fn record_osr_redefinition_class(&mut self, class: ClassId) -> bool {
        insert_unique(&mut self.classes_for_osr_redefinition, class)
    }

    /// Classes whose static finals were folded into the code
    pub fn record_static_final_field_class(&mut self, class: ClassId) -> bool {
        insert_unique(&mut self.classes_for_static_final_field_modification, class)
    }

    pub fn add_guard(&mut self, guard: VirtualGuard) -> usize {
        self.guards.push(guard);
        self.guards.len() - 1
    }

    pub fn add_side_effect_site(&mut self, site: GuardSite) {
        self.side_effect_sites.push(site);
    }

    /// A call to `method` that native registration re-points
    pub fn record_native_call_site(&mut self, method: MethodId, location: SiteLabel) -> bool {
        insert_unique(&mut self.native_call_sites, (method, location))
    }

    pub fn uses_preexistence(&self) -> bool {
        self.uses_preexistence
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
            && self.side_effect_sites.is_empty()
            && self.native_call_sites.is_empty()
            && self.classes_not_extended.is_empty()
            && self.classes_not_newly_extended.is_empty()
            && self.methods_not_overridden.is_empty()
            && self.classes_for_osr_redefinition.is_empty()
            && self.classes_for_static_final_field_modification.is_empty()
    }

    /// Whether commit has anything to validate or register
    pub fn needs_validation(&self) -> bool {
        self.uses_preexistence || !self.is_empty()
    }

    pub fn classes_not_extended(&self) -> &[ClassId] {
        &self.classes_not_extended
    }

    pub fn classes_not_newly_extended(&self) -> &[ClassId] {
        &self.classes_not_newly_extended
    }

    pub fn methods_not_overridden(&self) -> &[ResolvedMethod] {
        &self.methods_not_overridden
    }

    pub fn classes_for_osr_redefinition(&self) -> &[ClassId] {
        &self.classes_for_osr_redefinition
    }

    pub fn classes_for_static_final_field_modification(&self) -> &[ClassId] {
        &self.classes_for_static_final_field_modification
    }

    pub fn guards(&self) -> &[VirtualGuard] {
        &self.guards
    }

    pub fn guards_mut(&mut self) -> &mut [VirtualGuard] {
        &mut self.guards
    }

    pub fn side_effect_sites(&self) -> &[GuardSite] {
        &self.side_effect_sites
    }

    pub fn native_call_sites(&self) -> &[(MethodId, SiteLabel)] {
        &self.native_call_sites
    }

    /// Facts the guards lean on, inner guards included
    pub fn guard_facts(&self) -> impl Iterator<Item = Fact> + '_ {
        self.guards
            .iter()
            .flat_map(VirtualGuard::flatten)
            .flat_map(|g| g.assumes.iter().copied())
    }

    /// Every recorded fact, classes first
    pub fn facts(&self) -> impl Iterator<Item = Fact> + '_ {
        self.classes_not_extended
            .iter()
            .map(|c| Fact::ClassNotExtended(*c))
            .chain(self.classes_not_newly_extended.iter().map(|c| Fact::ClassNotNewlyExtended(*c)))
            .chain(self.methods_not_overridden.iter().map(|m| Fact::MethodNotOverridden(m.id)))
    }

    pub fn fact_count(&self) -> usize {
        self.classes_not_extended.len() + self.classes_not_newly_extended.len() + self.methods_not_overridden.len()
    }
}
