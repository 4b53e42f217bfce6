//! Bounded traversals over the subclass graph
//!
//! Every walk is a depth-first pre-order visit from some top class. The
//! visited set lives in a caller-owned [`VisitTracker`] rather than in the
//! shared nodes, so there is nothing to reset: the tracker is dropped on
//! every exit path, including early stop and budget overflow.

use rustc_hash::FxHashSet;

use super::{ClassHierarchy, ClassNode};
use crate::ids::{ClassId, MethodId, Selector};

/// Result of a capped collection
///
/// `TooMany` means the query could not be answered within its budget (too
/// many results, too many nodes visited, an unresolvable member, or
/// class-hierarchy optimizations disabled). There is no partial content to
/// look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collected<T> {
    Exact(T),
    TooMany,
}

impl<T> Collected<T> {
    pub fn exact(self) -> Option<T> {
        match self {
            Collected::Exact(v) => Some(v),
            Collected::TooMany => None,
        }
    }

    pub fn is_too_many(&self) -> bool {
        matches!(self, Collected::TooMany)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Collected<U> {
        match self {
            Collected::Exact(v) => Collected::Exact(f(v)),
            Collected::TooMany => Collected::TooMany,
        }
    }
}

/// What a visitor wants after seeing a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    Continue,
    SkipChildren,
    Stop,
}

/// How a walk ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd {
    Completed,
    /// The visitor returned [`Walk::Stop`]
    Stopped,
    /// The tracker's node budget ran out
    Exhausted,
    /// The top class is unknown or obsolete
    Obsolete,
}

enum Visit {
    First,
    Again,
    OverBudget,
}

/// Caller-local visited set with an optional node budget
#[derive(Debug)]
pub struct VisitTracker {
    seen: FxHashSet<ClassId>,
    order: Vec<ClassId>,
    budget: usize,
}

impl Default for VisitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl VisitTracker {
    pub fn new() -> Self {
        Self::with_budget(usize::MAX)
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            seen: FxHashSet::default(),
            order: Vec::new(),
            budget,
        }
    }

    fn visit(&mut self, id: ClassId) -> Visit {
        if self.seen.contains(&id) {
            return Visit::Again;
        }
        if self.order.len() >= self.budget {
            return Visit::OverBudget;
        }
        self.seen.insert(id);
        self.order.push(id);
        Visit::First
    }

    /// Classes visited so far, in visit order
    pub fn visited(&self) -> &[ClassId] {
        &self.order
    }

    pub fn contains(&self, id: ClassId) -> bool {
        self.seen.contains(&id)
    }
}

enum Implementer {
    Found(MethodId),
    Skip,
    Unresolved,
}

impl ClassHierarchy {
    /// Pre-order walk of every class below `top` (not `top` itself)
    pub fn visit_subclasses<F>(&self, top: ClassId, tracker: &mut VisitTracker, mut visit: F) -> WalkEnd
    where
        F: FnMut(&ClassNode) -> Walk,
    {
        let Some(node) = self.classes.get(&top) else {
            return WalkEnd::Obsolete;
        };
        let mut stack: Vec<ClassId> = node.subclasses.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            match tracker.visit(id) {
                Visit::Again => continue,
                Visit::OverBudget => return WalkEnd::Exhausted,
                Visit::First => {}
            }
            // an edge to a class unloaded mid-walk is skipped, not followed
            let Some(child) = self.classes.get(&id) else {
                continue;
            };
            match visit(child) {
                Walk::Stop => return WalkEnd::Stopped,
                Walk::SkipChildren => {}
                Walk::Continue => stack.extend(child.subclasses.iter().rev().copied()),
            }
        }
        WalkEnd::Completed
    }

    /// `top` plus every transitive subclass; unbounded
    pub fn subtree(&self, top: ClassId) -> Vec<ClassId> {
        if !self.classes.contains_key(&top) {
            return Vec::new();
        }
        let mut tracker = VisitTracker::new();
        let mut out = vec![top];
        self.visit_subclasses(top, &mut tracker, |node| {
            out.push(node.id());
            Walk::Continue
        });
        out
    }

    /// Every transitive subclass of `top`, within the node budget
    pub fn collect_subclasses(&self, top: ClassId) -> Collected<Vec<ClassId>> {
        let mut tracker = VisitTracker::with_budget(self.max_visited());
        let mut out = Vec::new();
        match self.visit_subclasses(top, &mut tracker, |node| {
            out.push(node.id());
            Walk::Continue
        }) {
            WalkEnd::Completed => Collected::Exact(out),
            _ => Collected::TooMany,
        }
    }

    /// Classes in the subtree of `top` with no subclasses of their own
    pub fn collect_leaves(&self, top: ClassId) -> Collected<Vec<ClassId>> {
        let Some(node) = self.classes.get(&top) else {
            return Collected::TooMany;
        };
        if node.subclasses.is_empty() {
            return Collected::Exact(vec![top]);
        }
        let mut tracker = VisitTracker::with_budget(self.max_visited());
        let mut leaves = Vec::new();
        match self.visit_subclasses(top, &mut tracker, |node| {
            if node.subclasses.is_empty() {
                leaves.push(node.id());
            }
            Walk::Continue
        }) {
            WalkEnd::Completed => Collected::Exact(leaves),
            _ => Collected::TooMany,
        }
    }

    /// Distinct methods that concrete classes in the subtree of `top`
    /// (including `top`) dispatch to. `resolver` returning `None` for a
    /// concrete class makes the whole query unanswerable.
    pub fn collect_implementers_with<R>(&self, top: ClassId, max_count: usize, mut resolver: R) -> Collected<Vec<MethodId>>
    where
        R: FnMut(&ClassNode) -> Option<MethodId>,
    {
        self.collect_implementers_inner(top, max_count, |node| match resolver(node) {
            Some(method) => Implementer::Found(method),
            None => Implementer::Unresolved,
        })
    }

    /// Implementers of `selector` under virtual dispatch
    pub fn collect_implementers(&self, top: ClassId, max_count: usize, selector: &Selector) -> Collected<Vec<MethodId>> {
        self.collect_implementers_with(top, max_count, |node| self.resolve_virtual(node.id(), selector))
    }

    /// Like [`collect_implementers`](Self::collect_implementers) but only
    /// counts implementers that already have a compiled body
    pub fn collect_compiled_implementers(
        &self,
        top: ClassId,
        max_count: usize,
        selector: &Selector,
    ) -> Collected<Vec<MethodId>> {
        self.collect_implementers_inner(top, max_count, |node| {
            match self.resolve_virtual(node.id(), selector) {
                None => Implementer::Unresolved,
                Some(method) if self.method(method).is_some_and(|m| m.compiled) => Implementer::Found(method),
                Some(_) => Implementer::Skip,
            }
        })
    }

    fn collect_implementers_inner<R>(&self, top: ClassId, max_count: usize, mut resolver: R) -> Collected<Vec<MethodId>>
    where
        R: FnMut(&ClassNode) -> Implementer,
    {
        if self.ch_opts_disabled() {
            return Collected::TooMany;
        }
        let Some(top_node) = self.classes.get(&top) else {
            return Collected::TooMany;
        };

        let mut found: Vec<MethodId> = Vec::new();
        let mut take = |node: &ClassNode| -> Walk {
            if !node.is_concrete() {
                return Walk::Continue;
            }
            match resolver(node) {
                Implementer::Unresolved => Walk::Stop,
                Implementer::Skip => Walk::Continue,
                Implementer::Found(method) => {
                    if !found.contains(&method) {
                        found.push(method);
                    }
                    if found.len() > max_count {
                        Walk::Stop
                    } else {
                        Walk::Continue
                    }
                }
            }
        };

        let mut tracker = VisitTracker::with_budget(self.max_visited());
        let end = if take(top_node) == Walk::Stop {
            WalkEnd::Stopped
        } else {
            self.visit_subclasses(top, &mut tracker, &mut take)
        };
        match end {
            WalkEnd::Completed if found.len() <= max_count => Collected::Exact(found),
            _ => Collected::TooMany,
        }
    }

    /// The one method every concrete class under `top` dispatches `selector` to
    pub fn find_single_implementer(&self, top: ClassId, selector: &Selector) -> Option<MethodId> {
        match self.collect_implementers(top, 2, selector) {
            Collected::Exact(methods) if methods.len() == 1 => methods.first().copied(),
            _ => None,
        }
    }

    /// Single implementer below an abstract (non-interface) class
    pub fn find_single_abstract_implementer(&self, top: ClassId, selector: &Selector) -> Option<MethodId> {
        let node = self.classes.get(&top)?;
        if !node.is_abstract() || node.is_interface() {
            return None;
        }
        self.find_single_implementer(top, selector)
    }

    /// The only concrete class in the subtree of `top`, if there is exactly one
    pub fn find_single_concrete_subclass(&self, top: ClassId) -> Option<ClassId> {
        if self.ch_opts_disabled() {
            return None;
        }
        let node = self.classes.get(&top)?;
        let mut found = node.is_concrete().then_some(top);
        let mut ambiguous = false;
        let mut tracker = VisitTracker::with_budget(self.max_visited());
        let end = self.visit_subclasses(top, &mut tracker, |node| {
            if !node.is_concrete() {
                return Walk::Continue;
            }
            if found.is_some() {
                ambiguous = true;
                return Walk::Stop;
            }
            found = Some(node.id());
            Walk::Continue
        });
        match end {
            WalkEnd::Completed if !ambiguous => found,
            _ => None,
        }
    }

    /// The first layer of non-interface classes below `top`; interfaces are walked through
    pub fn collect_all_non_interface_subclasses(&self, top: ClassId) -> Vec<ClassId> {
        let mut tracker = VisitTracker::new();
        let mut out = Vec::new();
        self.visit_subclasses(top, &mut tracker, |node| {
            if node.is_interface() {
                Walk::Continue
            } else {
                out.push(node.id());
                Walk::SkipChildren
            }
        });
        out
    }

    pub fn count_non_interface_subclasses(&self, top: ClassId, max: usize) -> Collected<usize> {
        let mut tracker = VisitTracker::with_budget(self.max_visited());
        let mut count = 0usize;
        match self.visit_subclasses(top, &mut tracker, |node| {
            if !node.is_interface() {
                count += 1;
            }
            if count > max {
                Walk::Stop
            } else {
                Walk::Continue
            }
        }) {
            WalkEnd::Completed => Collected::Exact(count),
            _ => Collected::TooMany,
        }
    }

    /// Subtype test, with covariant arrays. Unknown classes are never instances,
    /// and a primitive is an instance only of itself.
    pub fn is_instance_of(&self, sub: ClassId, sup: ClassId) -> bool {
        if sub == sup {
            return self.classes.contains_key(&sub);
        }
        let (Some(sub_node), Some(sup_node)) = (self.classes.get(&sub), self.classes.get(&sup)) else {
            return false;
        };
        if sub_node.is_primitive() || sup_node.is_primitive() {
            return false;
        }
        if Some(sup) == self.root() {
            return true;
        }
        if sub_node.is_array() && sup_node.is_array() {
            return match (sub_node.component(), sup_node.component()) {
                (Some(sc), Some(pc)) => {
                    let sc_primitive = self.classes.get(&sc).is_some_and(ClassNode::is_primitive);
                    !sc_primitive && self.is_instance_of(sc, pc)
                }
                _ => false,
            };
        }
        self.ancestors(sub).contains(&sup)
    }

    pub fn direct_subclasses(&self, id: ClassId) -> &[ClassId] {
        self.classes.get(&id).map(ClassNode::subclasses).unwrap_or(&[])
    }

    /// Sticky extension flag; an unknown class is conservatively extended
    pub fn class_has_been_extended(&self, id: ClassId) -> bool {
        self.classes.get(&id).map_or(true, ClassNode::has_been_extended)
    }

    /// Sticky override flag; an unknown method is conservatively overridden
    pub fn method_is_overridden(&self, method: MethodId) -> bool {
        self.methods.get(&method).map_or(true, |m| m.overridden)
    }

    /// Whether some class below `class` dispatches the method's selector elsewhere
    pub fn is_overridden_in_this_hierarchy(&self, method: MethodId, class: ClassId) -> bool {
        let Some(info) = self.methods.get(&method) else {
            return true;
        };
        if self.resolve_virtual(class, &info.selector) != Some(method) {
            return true;
        }
        let mut overridden = false;
        let mut tracker = VisitTracker::with_budget(self.max_visited());
        let end = self.visit_subclasses(class, &mut tracker, |node| {
            if node.declared_method(&info.selector).is_some_and(|m| m != method) {
                overridden = true;
                Walk::Stop
            } else {
                Walk::Continue
            }
        });
        overridden || end != WalkEnd::Completed
    }
}
