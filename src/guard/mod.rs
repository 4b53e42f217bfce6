//! Virtual guard records
//!
//! A guard protects a speculative fast path. NOP-able guards compile to a
//! patchable site that falls through while the guarded fact holds and is
//! patched into a branch to `destination` once it stops holding. Profiled
//! guards are real runtime tests and have no sites to patch.

use std::fmt;

use crate::code::SiteLabel;
use crate::ids::{ClassId, MethodId, Selector};
use crate::ledger::Fact;

/// What the guard speculates on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardKind {
    NonOverridden { class: ClassId, method: MethodId },
    Abstract { class: ClassId, selector: Selector },
    Hierarchy { class: ClassId, method: MethodId },
    Interface { class: ClassId, selector: Selector },
    /// Runtime test on a profiled receiver; `required_type` restricts passing receivers
    Profiled {
        class: ClassId,
        method: MethodId,
        required_type: Option<ClassId>,
    },
    /// Hot class redefinition
    Hcr { class: ClassId },
    /// On-stack replacement transition point
    Osr,
    MutableCallSite { cookie: u64, epoch: u64 },
    Breakpoint { method: MethodId },
    ArrayStoreCheck { class: ClassId },
    DirectMethod { method: MethodId },
    Dummy,
}

impl GuardKind {
    pub fn name(&self) -> &'static str {
        match self {
            GuardKind::NonOverridden { .. } => "NonOverriddenGuard",
            GuardKind::Abstract { .. } => "AbstractGuard",
            GuardKind::Hierarchy { .. } => "HierarchyGuard",
            GuardKind::Interface { .. } => "InterfaceGuard",
            GuardKind::Profiled { .. } => "ProfiledGuard",
            GuardKind::Hcr { .. } => "HCRGuard",
            GuardKind::Osr => "OSRGuard",
            GuardKind::MutableCallSite { .. } => "MutableCallSiteTargetGuard",
            GuardKind::Breakpoint { .. } => "BreakpointGuard",
            GuardKind::ArrayStoreCheck { .. } => "ArrayStoreCheckGuard",
            GuardKind::DirectMethod { .. } => "DirectMethodGuard",
            GuardKind::Dummy => "DummyGuard",
        }
    }

    /// The class the guard is bound to, if any
    pub fn bound_class(&self) -> Option<ClassId> {
        match self {
            GuardKind::NonOverridden { class, .. }
            | GuardKind::Abstract { class, .. }
            | GuardKind::Hierarchy { class, .. }
            | GuardKind::Interface { class, .. }
            | GuardKind::Profiled { class, .. }
            | GuardKind::Hcr { class }
            | GuardKind::ArrayStoreCheck { class } => Some(*class),
            _ => None,
        }
    }

    pub fn bound_method(&self) -> Option<MethodId> {
        match self {
            GuardKind::NonOverridden { method, .. }
            | GuardKind::Hierarchy { method, .. }
            | GuardKind::Profiled { method, .. }
            | GuardKind::Breakpoint { method }
            | GuardKind::DirectMethod { method } => Some(*method),
            _ => None,
        }
    }

    /// Compiled as a patchable NOP rather than an inline test
    pub fn is_nopable(&self) -> bool {
        !matches!(self, GuardKind::Profiled { .. })
    }
}

/// How the guard compares at run time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestType {
    /// Compare the receiver's dispatch table
    VftTest,
    /// Compare the resolved method
    MethodTest,
    DummyTest,
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestType::VftTest => write!(f, "VftTest"),
            TestType::MethodTest => write!(f, "MethodTest"),
            TestType::DummyTest => write!(f, "DummyTest"),
        }
    }
}

/// A patchable location and the slow path it branches to once patched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuardSite {
    pub location: SiteLabel,
    pub destination: SiteLabel,
}

/// One guard emitted by a compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualGuard {
    pub kind: GuardKind,
    pub test_type: TestType,
    pub sites: Vec<GuardSite>,
    /// Guards folded into this guard's sites
    pub inner: Vec<VirtualGuard>,
    /// Ledger facts whose breakage must patch this guard's sites
    pub assumes: Vec<Fact>,
    /// Also acts as an HCR guard on this class
    pub merged_with_hcr: Option<ClassId>,
    /// Also acts as an OSR transition point
    pub merged_with_osr: bool,
}

impl VirtualGuard {
    pub fn new(kind: GuardKind, test_type: TestType) -> Self {
        Self {
            kind,
            test_type,
            sites: Vec::new(),
            inner: Vec::new(),
            assumes: Vec::new(),
            merged_with_hcr: None,
            merged_with_osr: false,
        }
    }

    pub fn with_site(mut self, site: GuardSite) -> Self {
        self.sites.push(site);
        self
    }

    pub fn add_site(&mut self, site: GuardSite) {
        self.sites.push(site);
    }

    pub fn assuming(mut self, fact: Fact) -> Self {
        if !self.assumes.contains(&fact) {
            self.assumes.push(fact);
        }
        self
    }

    /// Fold another guard into this guard's sites
    pub fn merge_inner(&mut self, inner: VirtualGuard) {
        self.inner.push(inner);
    }

    pub fn merge_with_hcr(&mut self, class: ClassId) {
        self.merged_with_hcr = Some(class);
    }

    pub fn merge_with_osr(&mut self) {
        self.merged_with_osr = true;
    }

    pub fn is_osr(&self) -> bool {
        matches!(self.kind, GuardKind::Osr) || self.merged_with_osr
    }

    /// This guard and every inner guard, outermost first
    pub fn flatten(&self) -> Vec<&VirtualGuard> {
        let mut out = vec![self];
        for inner in &self.inner {
            out.extend(inner.flatten());
        }
        out
    }
}

impl fmt::Display for VirtualGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.name(), self.test_type)?;
        if let Some(class) = self.kind.bound_class() {
            write!(f, " class={}", class)?;
        }
        if let Some(method) = self.kind.bound_method() {
            write!(f, " method={}", method)?;
        }
        if !self.sites.is_empty() {
            write!(f, " sites={}", self.sites.len())?;
        }
        Ok(())
    }
}
