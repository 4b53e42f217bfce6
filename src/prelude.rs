//! Prelude module for convenient imports
//!
//! ```no_run
//! use devirt::prelude::*;
//!
//! let runtime = JitRuntime::new(JitOptions::default());
//! assert_eq!(runtime.active_compilations(), 0);
//! ```

// Runtime and compilations
pub use crate::runtime::{Compilation, JitRuntime, RuntimeEvent, RuntimeState};

// Error handling
pub use crate::commit::{CommitError, CommitSummary};
pub use crate::error::{Error, Result};

// Configuration
pub use crate::config::JitOptions;

// Identities
pub use crate::ids::{BodyId, ClassId, CodeAddress, CompileThreadSlot, MethodId, Selector};

// Class hierarchy
pub use crate::hierarchy::{ClassDescriptor, ClassFlags, ClassHierarchy, ClassPool, ClassSource, Collected, NoClassSource};

// Speculation
pub use crate::casts::{CastClassRef, CastOp, CastPlan, CastRequest, CastStep, CastTestPlanner};
pub use crate::guard::{GuardKind, GuardSite, TestType, VirtualGuard};
pub use crate::ledger::{AssumptionLedger, Fact};
pub use crate::profile::ClassProfile;
pub use crate::selector::{CallSite, GuardSelector, Selection};

// Runtime assumptions
pub use crate::assumptions::{AssumptionKind, AssumptionStats, NotifyReport, SubjectKey};
