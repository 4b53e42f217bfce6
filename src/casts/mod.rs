//! Test sequences for `instanceof` and `checkcast`
//!
//! [`CastTestPlanner::plan`] is a pure function of the cast shape, the
//! hierarchy and the profile. It picks a raw sequence of tests ending in one
//! terminal step, then a fixup pass inserts `LoadObjectClass` before the
//! first step that reads the object's class and hoists `EvaluateCastClass`
//! to the very front, so the cast class is never evaluated inside the
//! internal control flow of the sequence.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::JitOptions;
use crate::hierarchy::ClassHierarchy;
use crate::ids::ClassId;
use crate::profile::ClassProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastOp {
    InstanceOf,
    CheckCast,
    /// Checkcast whose failing path must also raise on null
    CheckCastAndNullCheck,
}

impl CastOp {
    pub fn is_check_cast(self) -> bool {
        !matches!(self, CastOp::InstanceOf)
    }
}

/// How the cast class reaches the compiled code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastClassRef {
    /// A resolved compile-time constant
    Resolved(ClassId),
    Unresolved,
    /// Computed at run time; `is_constant_address` when it is still a plain class address
    RuntimeVariable { is_constant_address: bool },
}

/// One step of a cast sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastStep {
    EvaluateCastClass,
    LoadObjectClass,
    NullTest,
    ClassEqualityTest,
    CastClassCacheTest,
    SuperClassTest,
    ProfiledClassTest,
    CompileTimeGuessClassTest,
    ArrayOfObjectTest,
    DynamicCacheObjectClassTest,
    DynamicCacheDynamicCastClassTest,
    HelperCall,
    GotoTrue,
    GotoFalse,
}

impl CastStep {
    pub fn is_terminal(self) -> bool {
        matches!(self, CastStep::HelperCall | CastStep::GotoTrue | CastStep::GotoFalse)
    }

    /// Reads the object's class in the main line
    pub fn needs_object_class(self) -> bool {
        matches!(
            self,
            CastStep::ProfiledClassTest
                | CastStep::CompileTimeGuessClassTest
                | CastStep::ArrayOfObjectTest
                | CastStep::ClassEqualityTest
                | CastStep::SuperClassTest
                | CastStep::CastClassCacheTest
        )
    }

    /// Reads the cast class in the main line. The helper call loads it out of line.
    pub fn needs_cast_class(self) -> bool {
        matches!(
            self,
            CastStep::ClassEqualityTest | CastStep::SuperClassTest | CastStep::CastClassCacheTest
        )
    }

    fn is_setup(self) -> bool {
        matches!(self, CastStep::EvaluateCastClass | CastStep::LoadObjectClass)
    }
}

impl fmt::Display for CastStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the compiler knows about the object operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectInfo {
    #[serde(default)]
    pub known_null: bool,
    #[serde(default)]
    pub may_be_null: bool,
}

/// Input to the planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastRequest {
    pub op: CastOp,
    pub cast_class: CastClassRef,
    #[serde(default)]
    pub object: ObjectInfo,
    /// The cast class expression has other uses, so it is evaluated up front regardless
    #[serde(default)]
    pub cast_class_shared: bool,
    #[serde(default)]
    pub profile: ClassProfile,
}

impl CastRequest {
    pub fn new(op: CastOp, cast_class: CastClassRef) -> Self {
        Self {
            op,
            cast_class,
            object: ObjectInfo::default(),
            cast_class_shared: false,
            profile: ClassProfile::new(),
        }
    }

    pub fn may_be_null(mut self) -> Self {
        self.object.may_be_null = true;
        self
    }

    pub fn known_null(mut self) -> Self {
        self.object.known_null = true;
        self
    }

    pub fn with_profile(mut self, profile: ClassProfile) -> Self {
        self.profile = profile;
        self
    }
}

/// A profiled class worth testing inline
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfiledCastClass {
    pub class: ClassId,
    pub instance_of_cast_class: bool,
    pub frequency: f64,
}

/// Planner output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CastPlan {
    pub steps: Vec<CastStep>,
    pub profiled: Vec<ProfiledCastClass>,
    pub compile_time_guess: Option<ClassId>,
    /// The hottest profiled class was the cast class itself
    pub top_class_was_cast_class: bool,
    pub top_class_probability: f64,
}

impl CastPlan {
    /// Steps without the setup (`EvaluateCastClass`, `LoadObjectClass`)
    pub fn tests(&self) -> Vec<CastStep> {
        self.steps.iter().copied().filter(|s| !s.is_setup()).collect()
    }

    pub fn terminal(&self) -> Option<CastStep> {
        self.steps.last().copied().filter(|s| s.is_terminal())
    }
}

impl fmt::Display for CastPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<String> = self.steps.iter().map(|s| s.to_string()).collect();
        write!(f, "[{}]", steps.join(", "))?;
        if let Some(guess) = self.compile_time_guess {
            write!(f, " guess={}", guess)?;
        }
        if !self.profiled.is_empty() {
            let classes: Vec<String> = self
                .profiled
                .iter()
                .map(|p| format!("{}@{:.2}", p.class, p.frequency))
                .collect();
            write!(f, " profiled={}", classes.join(","))?;
        }
        Ok(())
    }
}

pub struct CastTestPlanner<'a> {
    hierarchy: &'a ClassHierarchy,
    options: &'a JitOptions,
}

impl<'a> CastTestPlanner<'a> {
    pub fn new(hierarchy: &'a ClassHierarchy, options: &'a JitOptions) -> Self {
        Self { hierarchy, options }
    }

    pub fn plan(&self, request: &CastRequest) -> CastPlan {
        let mut plan = CastPlan {
            steps: Vec::new(),
            profiled: Vec::new(),
            compile_time_guess: None,
            top_class_was_cast_class: false,
            top_class_probability: 0.0,
        };
        let mut raw = Vec::new();
        if request.cast_class_shared {
            raw.push(CastStep::EvaluateCastClass);
        }

        let is_instance_of = request.op == CastOp::InstanceOf;
        let may_be_null = request.object.may_be_null && !request.object.known_null;
        let dynamic_cache = self.options.max_onsite_cache_slots_for_instanceof > 0;

        // an unknown or obsolete constant is no better than an unresolved one
        let cast_class = match request.cast_class {
            CastClassRef::Resolved(id) if self.hierarchy.find_class_info(id).is_some() => CastClassRef::Resolved(id),
            CastClassRef::Resolved(_) => CastClassRef::Unresolved,
            other => other,
        };

        if request.object.known_null {
            raw.push(if is_instance_of { CastStep::GotoFalse } else { CastStep::GotoTrue });
        } else {
            match cast_class {
                CastClassRef::Unresolved => {
                    if may_be_null {
                        raw.push(CastStep::NullTest);
                    }
                    raw.extend([CastStep::ClassEqualityTest, CastStep::CastClassCacheTest]);
                    if dynamic_cache {
                        raw.push(CastStep::DynamicCacheObjectClassTest);
                    }
                    raw.push(CastStep::HelperCall);
                }
                CastClassRef::RuntimeVariable { is_constant_address } => {
                    if may_be_null {
                        raw.push(CastStep::NullTest);
                    }
                    raw.extend([CastStep::ClassEqualityTest, CastStep::CastClassCacheTest]);
                    if self.options.supports_inlining_of_is_instance && is_instance_of && !is_constant_address {
                        raw.push(CastStep::SuperClassTest);
                    }
                    if dynamic_cache {
                        raw.push(CastStep::DynamicCacheDynamicCastClassTest);
                    }
                    raw.push(CastStep::HelperCall);
                }
                CastClassRef::Resolved(class) => self.plan_constant(request, class, may_be_null, &mut raw, &mut plan),
            }
        }

        plan.steps = fixup(raw);
        debug!(op = ?request.op, cast_class = ?request.cast_class, plan = %plan, "cast planned");
        plan
    }

    fn plan_constant(
        &self,
        request: &CastRequest,
        class: ClassId,
        may_be_null: bool,
        raw: &mut Vec<CastStep>,
        plan: &mut CastPlan,
    ) {
        let h = self.hierarchy;
        let Some(node) = h.find_class_info(class) else {
            raw.push(CastStep::HelperCall);
            return;
        };
        let is_instance_of = request.op == CastOp::InstanceOf;

        if node.is_primitive() {
            if request.op == CastOp::CheckCastAndNullCheck {
                raw.push(CastStep::NullTest);
            }
            raw.push(CastStep::GotoFalse);
            return;
        }

        if h.root() == Some(class) {
            let null_test = if is_instance_of {
                may_be_null
            } else {
                request.op == CastOp::CheckCastAndNullCheck
            };
            if null_test {
                raw.push(CastStep::NullTest);
            }
            raw.push(CastStep::GotoTrue);
            return;
        }

        if may_be_null {
            raw.push(CastStep::NullTest);
        }

        self.profile_cast_classes(request, class, plan);
        let profiled = !plan.profiled.is_empty();

        if (node.is_interface() || node.is_abstract()) && !is_instance_of {
            // for checkcast the cast is expected to succeed, so the single
            // concrete class is the natural first test
            plan.compile_time_guess = h.find_single_concrete_subclass(class);
        }
        let guess = plan.compile_time_guess.is_some();

        if node.is_array() {
            let component = node.component().and_then(|c| h.find_class_info(c));
            match component {
                Some(component) if !component.is_primitive() => {
                    let is_leaf = !component.is_array();
                    if is_leaf && h.root() == Some(component.id()) {
                        raw.extend([CastStep::ArrayOfObjectTest, CastStep::GotoFalse]);
                    } else if is_leaf && component.is_final() {
                        raw.extend([CastStep::ClassEqualityTest, CastStep::GotoFalse]);
                    } else {
                        if profiled && plan.top_class_was_cast_class {
                            raw.extend([
                                CastStep::ClassEqualityTest,
                                CastStep::ProfiledClassTest,
                                CastStep::CastClassCacheTest,
                            ]);
                        } else if profiled {
                            raw.extend([CastStep::ProfiledClassTest, CastStep::CastClassCacheTest]);
                        } else {
                            raw.extend([CastStep::ClassEqualityTest, CastStep::CastClassCacheTest]);
                        }
                        raw.push(CastStep::HelperCall);
                    }
                }
                _ => raw.extend([CastStep::ClassEqualityTest, CastStep::GotoFalse]),
            }
        } else if node.is_interface() {
            if guess {
                raw.push(CastStep::CompileTimeGuessClassTest);
            } else if profiled {
                raw.extend([CastStep::ProfiledClassTest, CastStep::CastClassCacheTest]);
            } else {
                raw.push(CastStep::CastClassCacheTest);
            }
            if self.options.max_onsite_cache_slots_for_instanceof > 0 {
                raw.push(CastStep::DynamicCacheObjectClassTest);
            }
            raw.push(CastStep::HelperCall);
        } else if node.is_abstract() {
            // the cast class cache is not updated for casts a superclass test decides
            if guess {
                raw.push(CastStep::CompileTimeGuessClassTest);
            } else if profiled {
                raw.push(CastStep::ProfiledClassTest);
            }
            raw.extend([CastStep::SuperClassTest, CastStep::GotoFalse]);
        } else if node.is_final() {
            raw.extend([CastStep::ClassEqualityTest, CastStep::GotoFalse]);
        } else {
            if profiled && plan.top_class_was_cast_class {
                raw.extend([CastStep::ClassEqualityTest, CastStep::ProfiledClassTest]);
            } else if profiled {
                raw.extend([CastStep::ProfiledClassTest, CastStep::ClassEqualityTest]);
            } else {
                raw.push(CastStep::ClassEqualityTest);
            }
            raw.extend([CastStep::SuperClassTest, CastStep::GotoFalse]);
        }
    }

    /// Hottest usable profiled classes, stopping at the first one below the threshold
    fn profile_cast_classes(&self, request: &CastRequest, cast_class: ClassId, plan: &mut CastPlan) {
        let total = request.profile.total();
        if total == 0 {
            return;
        }
        for entry in request.profile.sorted() {
            if plan.profiled.len() >= self.options.max_profiled_classes {
                break;
            }
            if self.hierarchy.is_obsolete_class(entry.class) || self.hierarchy.find_class_info(entry.class).is_none() {
                continue;
            }
            let instance_of_cast_class = self.hierarchy.is_instance_of(entry.class, cast_class);
            // no point speeding up a checkcast that is going to throw
            if request.op.is_check_cast() && !instance_of_cast_class {
                continue;
            }
            let frequency = entry.count as f64 / total as f64;
            if entry.class == cast_class && plan.profiled.is_empty() {
                plan.top_class_was_cast_class = true;
                plan.top_class_probability = frequency;
                continue;
            }
            if frequency < self.options.min_profiled_checkcast_frequency {
                break;
            }
            plan.profiled.push(ProfiledCastClass {
                class: entry.class,
                instance_of_cast_class,
                frequency,
            });
        }
    }
}

/// Insert `LoadObjectClass` before the first step that reads the object's
/// class and `EvaluateCastClass` at the front; drop repeated steps.
fn fixup(raw: Vec<CastStep>) -> Vec<CastStep> {
    let mut out: Vec<CastStep> = Vec::with_capacity(raw.len() + 2);
    let mut object_class_loaded = false;
    let mut cast_class_evaluated = false;

    for step in raw {
        if out.contains(&step) {
            continue;
        }
        match step {
            CastStep::EvaluateCastClass => {
                cast_class_evaluated = true;
                out.insert(0, step);
                continue;
            }
            CastStep::LoadObjectClass => object_class_loaded = true,
            _ => {
                if step.needs_object_class() && !object_class_loaded {
                    out.push(CastStep::LoadObjectClass);
                    object_class_loaded = true;
                }
                if step.needs_cast_class() && !cast_class_evaluated {
                    out.insert(0, CastStep::EvaluateCastClass);
                    cast_class_evaluated = true;
                }
            }
        }
        out.push(step);
        if step.is_terminal() {
            break;
        }
    }
    out
}
