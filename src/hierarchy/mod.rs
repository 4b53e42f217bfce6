//! Persistent class-hierarchy registry
//!
//! One node per loaded class, keyed by [`ClassId`]. Subclass edges are id
//! lists (a class is a child of its superclass and of every interface it
//! directly implements), so the edge graph is a DAG rooted at the first
//! class loaded without a superclass.
//!
//! The registry is not internally synchronized. The runtime owns it behind
//! the global class-table lock and every mutation or multi-node walk happens
//! with that lock held; see [`crate::runtime::JitRuntime::lock`].
//!
//! Mutations return the [`HierarchyEvent`]s they caused so the caller can
//! drive the runtime-assumption patch protocol.

mod queries;

pub use queries::{Collected, VisitTracker, Walk, WalkEnd};

use bitflags::bitflags;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::JitOptions;
use crate::error::{Error, Result};
use crate::ids::{ClassId, CompileThreadSlot, MethodId, Selector};

bitflags! {
    /// Static shape of a class, fixed at load time
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ClassFlags: u8 {
        const FINAL = 1 << 0;
        const ABSTRACT = 1 << 1;
        const INTERFACE = 1 << 2;
        const ARRAY = 1 << 3;
        const PRIMITIVE = 1 << 4;
    }
}

bitflags! {
    /// Mutable per-node state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u8 {
        const INITIALIZED = 1 << 0;
        const HAS_RECOGNIZED_ANNOTATIONS = 1 << 1;
        const ALREADY_CHECKED_ANNOTATIONS = 1 << 2;
        /// Sticky: set on the first subclass load and never cleared, even by unload
        const EXTENDED = 1 << 3;
    }
}

/// A method declared by a class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub id: MethodId,
    pub selector: Selector,
    #[serde(default)]
    pub is_abstract: bool,
}

/// Everything the class loader tells us about a class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDescriptor {
    pub id: ClassId,
    pub name: String,
    /// `None` only for the root; other classes without one are parented to the root
    #[serde(default)]
    pub superclass: Option<ClassId>,
    #[serde(default)]
    pub interfaces: Vec<ClassId>,
    #[serde(default = "ClassFlags::empty")]
    pub flags: ClassFlags,
    /// Component class of an array class
    #[serde(default)]
    pub component: Option<ClassId>,
    #[serde(default)]
    pub methods: Vec<MethodDescriptor>,
}

impl ClassDescriptor {
    pub fn new(id: ClassId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            superclass: None,
            interfaces: Vec::new(),
            flags: ClassFlags::empty(),
            component: None,
            methods: Vec::new(),
        }
    }

    pub fn extends(mut self, superclass: ClassId) -> Self {
        self.superclass = Some(superclass);
        self
    }

    pub fn implements(mut self, interface: ClassId) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn with_flags(mut self, flags: ClassFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn array_of(mut self, component: ClassId) -> Self {
        self.flags |= ClassFlags::ARRAY;
        self.component = Some(component);
        self
    }

    pub fn method(mut self, id: MethodId, selector: &str) -> Self {
        self.methods.push(MethodDescriptor {
            id,
            selector: Selector::new(selector),
            is_abstract: false,
        });
        self
    }

    pub fn abstract_method(mut self, id: MethodId, selector: &str) -> Self {
        self.methods.push(MethodDescriptor {
            id,
            selector: Selector::new(selector),
            is_abstract: true,
        });
        self
    }
}

/// Supplies descriptors for supertypes that are referenced but not yet loaded
pub trait ClassSource {
    fn describe(&self, id: ClassId) -> Option<ClassDescriptor>;
}

/// A source that knows nothing; every supertype must already be loaded
pub struct NoClassSource;

impl ClassSource for NoClassSource {
    fn describe(&self, _id: ClassId) -> Option<ClassDescriptor> {
        None
    }
}

/// A pool of descriptors loaded on demand
#[derive(Debug, Default, Clone)]
pub struct ClassPool {
    descriptors: FxHashMap<ClassId, ClassDescriptor>,
}

impl ClassPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, descriptor: ClassDescriptor) {
        self.descriptors.insert(descriptor.id, descriptor);
    }
}

impl ClassSource for ClassPool {
    fn describe(&self, id: ClassId) -> Option<ClassDescriptor> {
        self.descriptors.get(&id).cloned()
    }
}

/// Registry node for one loaded class
#[derive(Debug, Clone)]
pub struct ClassNode {
    descriptor: ClassDescriptor,
    subclasses: Vec<ClassId>,
    declared: FxHashMap<Selector, MethodId>,
    flags: NodeFlags,
    should_not_be_newly_extended: u32,
}

impl ClassNode {
    fn new(descriptor: ClassDescriptor) -> Self {
        let declared = descriptor
            .methods
            .iter()
            .map(|m| (m.selector.clone(), m.id))
            .collect();
        Self {
            descriptor,
            subclasses: Vec::new(),
            declared,
            flags: NodeFlags::empty(),
            should_not_be_newly_extended: 0,
        }
    }

    pub fn id(&self) -> ClassId {
        self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ClassDescriptor {
        &self.descriptor
    }

    pub fn superclass(&self) -> Option<ClassId> {
        self.descriptor.superclass
    }

    pub fn interfaces(&self) -> &[ClassId] {
        &self.descriptor.interfaces
    }

    pub fn component(&self) -> Option<ClassId> {
        self.descriptor.component
    }

    /// Direct subclasses (and direct implementers, for an interface), in load order
    pub fn subclasses(&self) -> &[ClassId] {
        &self.subclasses
    }

    pub fn class_flags(&self) -> ClassFlags {
        self.descriptor.flags
    }

    pub fn node_flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn is_interface(&self) -> bool {
        self.descriptor.flags.contains(ClassFlags::INTERFACE)
    }

    pub fn is_abstract(&self) -> bool {
        self.descriptor.flags.contains(ClassFlags::ABSTRACT)
    }

    pub fn is_final(&self) -> bool {
        self.descriptor.flags.contains(ClassFlags::FINAL)
    }

    pub fn is_array(&self) -> bool {
        self.descriptor.flags.contains(ClassFlags::ARRAY)
    }

    pub fn is_primitive(&self) -> bool {
        self.descriptor.flags.contains(ClassFlags::PRIMITIVE)
    }

    /// Neither an interface nor abstract
    pub fn is_concrete(&self) -> bool {
        !self.descriptor.flags.intersects(ClassFlags::INTERFACE | ClassFlags::ABSTRACT)
    }

    pub fn is_initialized(&self) -> bool {
        self.flags.contains(NodeFlags::INITIALIZED)
    }

    pub fn has_been_extended(&self) -> bool {
        self.flags.contains(NodeFlags::EXTENDED)
    }

    pub fn declared_method(&self, selector: &Selector) -> Option<MethodId> {
        self.declared.get(selector).copied()
    }

    /// Raw "should not be newly extended" slot bits
    pub fn should_not_be_newly_extended(&self) -> u32 {
        self.should_not_be_newly_extended
    }
}

/// Registry-side record of a method
#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    pub id: MethodId,
    pub owner: ClassId,
    pub selector: Selector,
    pub is_abstract: bool,
    /// Sticky: some loaded class declared an override
    pub overridden: bool,
    /// A compiled body exists for this method
    pub compiled: bool,
}

/// A hierarchy change the runtime must react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HierarchyEvent {
    ClassLoaded(ClassId),
    ClassExtended { superclass: ClassId, subclass: ClassId },
    ClassInitialized(ClassId),
    ClassRedefined { old: ClassId, new: ClassId },
    ClassUnloaded(ClassId),
    MethodOverridden { method: MethodId, by: Option<MethodId> },
}

/// The process-wide class-hierarchy table
#[derive(Debug)]
pub struct ClassHierarchy {
    classes: FxHashMap<ClassId, ClassNode>,
    methods: FxHashMap<MethodId, MethodInfo>,
    obsolete: FxHashSet<ClassId>,
    root: Option<ClassId>,
    failed_slots: u32,
    max_visited: usize,
    disable_ch_opts: bool,
}

impl Default for ClassHierarchy {
    fn default() -> Self {
        Self::new(&JitOptions::default())
    }
}

impl ClassHierarchy {
    pub fn new(options: &JitOptions) -> Self {
        Self {
            classes: FxHashMap::default(),
            methods: FxHashMap::default(),
            obsolete: FxHashSet::default(),
            root: None,
            failed_slots: 0,
            max_visited: options.max_num_visited_subclasses,
            disable_ch_opts: options.disable_ch_opts,
        }
    }

    /// O(1) node lookup
    pub fn find_class_info(&self, id: ClassId) -> Option<&ClassNode> {
        self.classes.get(&id)
    }

    pub fn class(&self, id: ClassId) -> Result<&ClassNode> {
        self.classes.get(&id).ok_or_else(|| Error::unknown_class(id))
    }

    pub fn method(&self, id: MethodId) -> Option<&MethodInfo> {
        self.methods.get(&id)
    }

    pub fn root(&self) -> Option<ClassId> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Unloaded or redefined-away
    pub fn is_obsolete_class(&self, id: ClassId) -> bool {
        self.obsolete.contains(&id)
    }

    pub fn find_class_by_name(&self, name: &str) -> Option<ClassId> {
        self.classes
            .values()
            .find(|node| node.descriptor.name == name)
            .map(ClassNode::id)
    }

    /// Virtual dispatch: the nearest declaration of `selector` on the superclass chain
    pub fn resolve_virtual(&self, class: ClassId, selector: &Selector) -> Option<MethodId> {
        let mut current = Some(class);
        while let Some(id) = current {
            let node = self.classes.get(&id)?;
            if let Some(method) = node.declared_method(selector) {
                return Some(method);
            }
            current = node.superclass();
        }
        None
    }

    /// Load a class, first loading any missing supertypes from `source`
    pub fn class_loaded(
        &mut self,
        descriptor: ClassDescriptor,
        source: &dyn ClassSource,
    ) -> Result<Vec<HierarchyEvent>> {
        let mut events = Vec::new();
        let mut pending = Vec::new();
        self.load_recursive(descriptor, source, &mut pending, &mut events)?;
        Ok(events)
    }

    fn load_recursive(
        &mut self,
        mut descriptor: ClassDescriptor,
        source: &dyn ClassSource,
        pending: &mut Vec<ClassId>,
        events: &mut Vec<HierarchyEvent>,
    ) -> Result<()> {
        let id = descriptor.id;
        if self.classes.contains_key(&id) {
            return Err(Error::AlreadyLoaded(id));
        }
        if descriptor.superclass.is_none() {
            descriptor.superclass = self.root;
        }

        let supertypes: Vec<ClassId> = descriptor
            .superclass
            .iter()
            .chain(descriptor.interfaces.iter())
            .copied()
            .collect();

        pending.push(id);
        for &sup in &supertypes {
            if self.classes.contains_key(&sup) {
                continue;
            }
            let missing = Error::MissingSupertype { class: id, missing: sup };
            if pending.contains(&sup) {
                return Err(missing);
            }
            let sup_descriptor = source.describe(sup).ok_or(missing)?;
            self.load_recursive(sup_descriptor, source, pending, events)?;
        }
        pending.pop();

        let mut seen = FxHashSet::default();
        for m in &descriptor.methods {
            if self.methods.contains_key(&m.id) || !seen.insert(m.id) {
                return Err(Error::DuplicateMethod(m.id));
            }
        }

        events.push(HierarchyEvent::ClassLoaded(id));

        if let Some(sup) = descriptor.superclass {
            for m in &descriptor.methods {
                if let Some(inherited) = self.resolve_virtual(sup, &m.selector) {
                    if let Some(info) = self.methods.get_mut(&inherited) {
                        info.overridden = true;
                    }
                    trace!(method = %inherited, by = %m.id, "method overridden");
                    events.push(HierarchyEvent::MethodOverridden {
                        method: inherited,
                        by: Some(m.id),
                    });
                }
            }
        }

        for m in &descriptor.methods {
            self.methods.insert(
                m.id,
                MethodInfo {
                    id: m.id,
                    owner: id,
                    selector: m.selector.clone(),
                    is_abstract: m.is_abstract,
                    overridden: false,
                    compiled: false,
                },
            );
        }

        if descriptor.superclass.is_none() {
            self.root = Some(id);
        }
        let name = descriptor.name.clone();
        self.classes.insert(id, ClassNode::new(descriptor));
        self.obsolete.remove(&id);

        // Poison compilations that promised some ancestor would not be newly extended
        let poisoned = self
            .ancestors(id)
            .iter()
            .filter_map(|a| self.classes.get(a))
            .fold(0u32, |acc, node| acc | node.should_not_be_newly_extended);
        if poisoned != 0 {
            debug!(class = %id, slots = format_args!("{:#b}", poisoned), "compile slots poisoned by new subclass");
            self.failed_slots |= poisoned;
        }

        for sup in supertypes {
            if let Some(parent) = self.classes.get_mut(&sup) {
                if !parent.subclasses.contains(&id) {
                    parent.subclasses.push(id);
                }
                parent.flags.insert(NodeFlags::EXTENDED);
                events.push(HierarchyEvent::ClassExtended {
                    superclass: sup,
                    subclass: id,
                });
            }
        }

        debug!(class = %id, %name, "class loaded");
        Ok(())
    }

    /// Record an extension edge reported separately from the load
    pub fn class_extended(&mut self, superclass: ClassId, subclass: ClassId) -> Result<Vec<HierarchyEvent>> {
        if !self.classes.contains_key(&subclass) {
            return Err(Error::unknown_class(subclass));
        }
        if !self.classes.contains_key(&superclass) {
            return Err(Error::unknown_class(superclass));
        }
        if superclass == subclass || self.subtree(subclass).contains(&superclass) {
            return Err(Error::CyclicHierarchy { superclass, subclass });
        }
        let poisoned = std::iter::once(superclass)
            .chain(self.ancestors(superclass))
            .filter_map(|a| self.classes.get(&a))
            .fold(0u32, |acc, node| acc | node.should_not_be_newly_extended);
        self.failed_slots |= poisoned;

        let parent = self
            .classes
            .get_mut(&superclass)
            .ok_or_else(|| Error::unknown_class(superclass))?;
        if !parent.subclasses.contains(&subclass) {
            parent.subclasses.push(subclass);
        }
        parent.flags.insert(NodeFlags::EXTENDED);
        debug!(superclass = %superclass, subclass = %subclass, "class extended");
        Ok(vec![HierarchyEvent::ClassExtended { superclass, subclass }])
    }

    pub fn class_initialized(&mut self, id: ClassId) -> Result<Vec<HierarchyEvent>> {
        let node = self.classes.get_mut(&id).ok_or_else(|| Error::unknown_class(id))?;
        node.flags.insert(NodeFlags::INITIALIZED);
        trace!(class = %id, "class initialized");
        Ok(vec![HierarchyEvent::ClassInitialized(id)])
    }

    /// Re-key `old` as `new`, preserving every edge and declared method
    pub fn class_redefined(&mut self, old: ClassId, new: ClassId) -> Result<Vec<HierarchyEvent>> {
        if self.classes.contains_key(&new) {
            return Err(Error::AlreadyLoaded(new));
        }
        let mut node = self.classes.remove(&old).ok_or_else(|| Error::unknown_class(old))?;
        node.descriptor.id = new;

        let parents: Vec<ClassId> = node
            .superclass()
            .into_iter()
            .chain(node.interfaces().iter().copied())
            .collect();
        for parent in parents {
            if let Some(p) = self.classes.get_mut(&parent) {
                for edge in p.subclasses.iter_mut().filter(|e| **e == old) {
                    *edge = new;
                }
            }
        }
        for child in node.subclasses.clone() {
            if let Some(c) = self.classes.get_mut(&child) {
                if c.descriptor.superclass == Some(old) {
                    c.descriptor.superclass = Some(new);
                }
                for iface in c.descriptor.interfaces.iter_mut().filter(|i| **i == old) {
                    *iface = new;
                }
            }
        }
        for method in node.declared.values() {
            if let Some(info) = self.methods.get_mut(method) {
                info.owner = new;
            }
        }
        if self.root == Some(old) {
            self.root = Some(new);
        }
        self.classes.insert(new, node);
        self.obsolete.insert(old);
        debug!(old = %old, new = %new, "class redefined");
        Ok(vec![HierarchyEvent::ClassRedefined { old, new }])
    }

    /// Detach and free a class. A class with live subclasses cannot go first.
    pub fn class_unloaded(&mut self, id: ClassId) -> Result<Vec<HierarchyEvent>> {
        let node = self.classes.get(&id).ok_or_else(|| Error::unknown_class(id))?;
        if !node.subclasses.is_empty() {
            return Err(Error::LiveSubclasses {
                class: id,
                live: node.subclasses.len(),
            });
        }
        let Some(node) = self.classes.remove(&id) else {
            return Err(Error::unknown_class(id));
        };
        for parent in node.superclass().into_iter().chain(node.interfaces().iter().copied()) {
            if let Some(p) = self.classes.get_mut(&parent) {
                p.subclasses.retain(|c| *c != id);
            }
        }
        for method in node.declared.values() {
            self.methods.remove(method);
        }
        if self.root == Some(id) {
            self.root = None;
        }
        self.obsolete.insert(id);
        debug!(class = %id, "class unloaded");
        Ok(vec![HierarchyEvent::ClassUnloaded(id)])
    }

    /// An override reported by the runtime without a class load (e.g. redefinition)
    pub fn method_overridden(&mut self, method: MethodId) -> Result<Vec<HierarchyEvent>> {
        let info = self.methods.get_mut(&method).ok_or_else(|| Error::unknown_method(method))?;
        info.overridden = true;
        Ok(vec![HierarchyEvent::MethodOverridden { method, by: None }])
    }

    pub fn set_method_compiled(&mut self, method: MethodId, compiled: bool) {
        if let Some(info) = self.methods.get_mut(&method) {
            info.compiled = compiled;
        }
    }

    pub fn set_annotation_flags(&mut self, id: ClassId, recognized: bool) -> Result<()> {
        let node = self.classes.get_mut(&id).ok_or_else(|| Error::unknown_class(id))?;
        node.flags.insert(NodeFlags::ALREADY_CHECKED_ANNOTATIONS);
        node.flags.set(NodeFlags::HAS_RECOGNIZED_ANNOTATIONS, recognized);
        Ok(())
    }

    /// Promise for `slot` that no new subclass of `id` will appear until cleanup
    pub fn set_should_not_be_newly_extended(&mut self, id: ClassId, slot: CompileThreadSlot) -> bool {
        match self.classes.get_mut(&id) {
            Some(node) => {
                node.should_not_be_newly_extended |= slot.mask();
                true
            }
            None => false,
        }
    }

    pub fn clear_should_not_be_newly_extended(&mut self, id: ClassId, slot: CompileThreadSlot) {
        if let Some(node) = self.classes.get_mut(&id) {
            node.should_not_be_newly_extended &= !slot.mask();
        }
    }

    /// A class load broke a promise made by this slot's compilation
    pub fn slot_failed(&self, slot: CompileThreadSlot) -> bool {
        self.failed_slots & slot.mask() != 0
    }

    pub fn reset_slot(&mut self, slot: CompileThreadSlot) {
        self.failed_slots &= !slot.mask();
    }

    /// All transitive supertypes (superclasses and interfaces), nearest first
    pub fn ancestors(&self, id: ClassId) -> Vec<ClassId> {
        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        if let Some(node) = self.classes.get(&id) {
            queue.extend(node.superclass());
            queue.extend(node.interfaces().iter().copied());
        }
        while let Some(next) = queue.pop_front() {
            if out.contains(&next) {
                continue;
            }
            out.push(next);
            if let Some(node) = self.classes.get(&next) {
                queue.extend(node.superclass());
                queue.extend(node.interfaces().iter().copied());
            }
        }
        out
    }

    pub(crate) fn max_visited(&self) -> usize {
        self.max_visited
    }

    pub(crate) fn ch_opts_disabled(&self) -> bool {
        self.disable_ch_opts
    }
}
