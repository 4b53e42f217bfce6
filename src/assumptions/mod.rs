//! Runtime assumptions and the patch-on-event protocol
//!
//! An assumption says: "when event `kind` happens to `subject`, rewrite this
//! code". Assumptions live in a slot arena and are threaded onto two chains:
//! the bucket for their `(kind, subject)` key, which an event drains, and
//! the chain of the body that owns them, which [`AssumptionTable::discard_body`]
//! drains without looking at anything else.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Serialize;
use slotmap::{new_key_type, SlotMap};
use tracing::{debug, trace, warn};

use crate::code::{PatchOutcome, PatchTarget};
use crate::ids::{BodyId, ClassId, CodeAddress, MethodId};

new_key_type! {
    /// Arena handle of a registered assumption
    pub struct AssumptionKey;
}

/// Event kinds an assumption can be keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AssumptionKind {
    OnClassExtend,
    OnMethodOverride,
    OnClassRedefinition,
    OnStaticFinalFieldModification,
    OnMutableCallSiteChange,
    OnMethodBreakpoint,
    OnRegisterNative,
}

impl AssumptionKind {
    pub const ALL: [AssumptionKind; 7] = [
        AssumptionKind::OnClassExtend,
        AssumptionKind::OnMethodOverride,
        AssumptionKind::OnClassRedefinition,
        AssumptionKind::OnStaticFinalFieldModification,
        AssumptionKind::OnMutableCallSiteChange,
        AssumptionKind::OnMethodBreakpoint,
        AssumptionKind::OnRegisterNative,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            AssumptionKind::OnClassExtend => "class-extend",
            AssumptionKind::OnMethodOverride => "method-override",
            AssumptionKind::OnClassRedefinition => "class-redefinition",
            AssumptionKind::OnStaticFinalFieldModification => "static-final-modification",
            AssumptionKind::OnMutableCallSiteChange => "mutable-call-site",
            AssumptionKind::OnMethodBreakpoint => "method-breakpoint",
            AssumptionKind::OnRegisterNative => "register-native",
        }
    }
}

impl fmt::Display for AssumptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The identity an event carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SubjectKey {
    Class(ClassId),
    Method(MethodId),
    /// Mutable call sites are keyed by an opaque cookie
    Cookie(u64),
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectKey::Class(c) => write!(f, "class {}", c),
            SubjectKey::Method(m) => write!(f, "method {}", m),
            SubjectKey::Cookie(c) => write!(f, "cookie {:#x}", c),
        }
    }
}

/// One (location, destination) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchPair {
    pub location: CodeAddress,
    pub destination: CodeAddress,
}

/// What firing an assumption does to code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssumptionAction {
    /// Branch one guard site to its slow path
    PatchSite(PatchPair),
    /// Branch every site of a group shared by several assumptions
    PatchSites(Arc<[PatchPair]>),
    /// Send the body's entry to the recompilation helper and invalidate the body
    Recompile { entry: CodeAddress, helper: CodeAddress },
    /// Point a native call site at the address the registration event carries
    PatchNativeCall { location: CodeAddress },
}

#[derive(Debug, Clone)]
pub struct RuntimeAssumption {
    pub kind: AssumptionKind,
    pub subject: SubjectKey,
    pub body: BodyId,
    pub action: AssumptionAction,
}

/// Per-kind counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub registered: u64,
    pub fired: u64,
    pub reclaimed: u64,
}

/// Counters for every assumption kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssumptionStats {
    kinds: [KindStats; 7],
}

impl AssumptionStats {
    pub fn get(&self, kind: AssumptionKind) -> KindStats {
        self.kinds[kind.index()]
    }

    pub fn total(&self) -> KindStats {
        self.kinds.iter().fold(KindStats::default(), |acc, k| KindStats {
            registered: acc.registered + k.registered,
            fired: acc.fired + k.fired,
            reclaimed: acc.reclaimed + k.reclaimed,
        })
    }

    /// Registered assumptions neither fired nor reclaimed
    pub fn live(&self) -> u64 {
        let t = self.total();
        t.registered - t.fired - t.reclaimed
    }
}

impl fmt::Display for AssumptionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Runtime Assumptions ===")?;
        for kind in AssumptionKind::ALL {
            let s = self.get(kind);
            if s.registered == 0 {
                continue;
            }
            writeln!(
                f,
                "{:<26} registered {:>5}  fired {:>5}  reclaimed {:>5}",
                kind.name(),
                s.registered,
                s.fired,
                s.reclaimed
            )?;
        }
        write!(f, "live: {}", self.live())
    }
}

/// What one event did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Assumptions removed because the event fired them
    pub fired: usize,
    /// Sites actually rewritten (already-patched sites not counted)
    pub patched: usize,
    /// Bodies whose entry now leads to recompilation
    pub invalidated: Vec<BodyId>,
}

impl NotifyReport {
    pub fn merge(&mut self, other: NotifyReport) {
        self.fired += other.fired;
        self.patched += other.patched;
        for body in other.invalidated {
            if !self.invalidated.contains(&body) {
                self.invalidated.push(body);
            }
        }
    }
}

/// The keyed store of all live assumptions
#[derive(Debug, Default)]
pub struct AssumptionTable {
    arena: SlotMap<AssumptionKey, RuntimeAssumption>,
    buckets: FxHashMap<(AssumptionKind, SubjectKey), Vec<AssumptionKey>>,
    by_body: FxHashMap<BodyId, Vec<AssumptionKey>>,
    stats: AssumptionStats,
}

impl AssumptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: AssumptionKind,
        subject: SubjectKey,
        body: BodyId,
        action: AssumptionAction,
    ) -> AssumptionKey {
        let key = self.arena.insert(RuntimeAssumption {
            kind,
            subject,
            body,
            action,
        });
        self.buckets.entry((kind, subject)).or_default().push(key);
        self.by_body.entry(body).or_default().push(key);
        self.stats.kinds[kind.index()].registered += 1;
        trace!(%kind, %subject, %body, "assumption registered");
        key
    }

    /// Fire every assumption keyed on `(kind, subject)`: patch, then unlink and free.
    ///
    /// `event_destination` is the address carried by events that supply one
    /// (native registration); other actions ignore it.
    pub fn notify(
        &mut self,
        kind: AssumptionKind,
        subject: SubjectKey,
        patcher: &dyn PatchTarget,
        event_destination: Option<CodeAddress>,
    ) -> NotifyReport {
        let mut report = NotifyReport::default();
        let Some(keys) = self.buckets.remove(&(kind, subject)) else {
            return report;
        };

        for key in keys {
            let Some(assumption) = self.arena.remove(key) else {
                continue;
            };
            if let Some(chain) = self.by_body.get_mut(&assumption.body) {
                chain.retain(|k| *k != key);
                if chain.is_empty() {
                    self.by_body.remove(&assumption.body);
                }
            }

            let mut apply = |location: CodeAddress, destination: CodeAddress| {
                match patcher.patch(location, destination) {
                    Ok(PatchOutcome::Patched) => report.patched += 1,
                    Ok(PatchOutcome::AlreadyPatched) => {}
                    Err(e) => warn!(%kind, %subject, error = %e, "assumption patch skipped"),
                }
            };
            match &assumption.action {
                AssumptionAction::PatchSite(pair) => apply(pair.location, pair.destination),
                AssumptionAction::PatchSites(pairs) => {
                    for pair in pairs.iter() {
                        apply(pair.location, pair.destination);
                    }
                }
                AssumptionAction::Recompile { entry, helper } => {
                    apply(*entry, *helper);
                    if !report.invalidated.contains(&assumption.body) {
                        report.invalidated.push(assumption.body);
                    }
                }
                AssumptionAction::PatchNativeCall { location } => match event_destination {
                    Some(dest) => apply(*location, dest),
                    None => warn!(%subject, "native registration without a target address"),
                },
            }

            report.fired += 1;
            self.stats.kinds[kind.index()].fired += 1;
        }

        if report.fired > 0 {
            debug!(%kind, %subject, fired = report.fired, patched = report.patched, "assumptions fired");
        }
        report
    }

    /// Free every assumption owned by `body`; returns how many were reclaimed
    pub fn discard_body(&mut self, body: BodyId) -> usize {
        let Some(keys) = self.by_body.remove(&body) else {
            return 0;
        };
        let mut reclaimed = 0;
        for key in keys {
            let Some(assumption) = self.arena.remove(key) else {
                continue;
            };
            let bucket_key = (assumption.kind, assumption.subject);
            if let Some(bucket) = self.buckets.get_mut(&bucket_key) {
                bucket.retain(|k| *k != key);
                if bucket.is_empty() {
                    self.buckets.remove(&bucket_key);
                }
            }
            self.stats.kinds[assumption.kind.index()].reclaimed += 1;
            reclaimed += 1;
        }
        debug!(%body, reclaimed, "body assumptions reclaimed");
        reclaimed
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get(&self, key: AssumptionKey) -> Option<&RuntimeAssumption> {
        self.arena.get(key)
    }

    /// Assumptions currently waiting on `(kind, subject)`
    pub fn bucket(&self, kind: AssumptionKind, subject: SubjectKey) -> impl Iterator<Item = &RuntimeAssumption> {
        self.buckets
            .get(&(kind, subject))
            .into_iter()
            .flatten()
            .filter_map(|k| self.arena.get(*k))
    }

    pub fn count(&self, kind: AssumptionKind, subject: SubjectKey) -> usize {
        self.buckets.get(&(kind, subject)).map_or(0, Vec::len)
    }

    pub fn for_body(&self, body: BodyId) -> impl Iterator<Item = &RuntimeAssumption> {
        self.by_body
            .get(&body)
            .into_iter()
            .flatten()
            .filter_map(|k| self.arena.get(*k))
    }

    pub fn stats(&self) -> &AssumptionStats {
        &self.stats
    }
}
