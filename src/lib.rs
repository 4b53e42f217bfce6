//! devirt: the speculative-devirtualization core of a JIT
//!
//! The compiler emits monomorphic code for virtual calls and type tests
//! whose correctness rests on facts about the current class hierarchy
//! ("this method is not overridden", "this interface has one implementer").
//! Each fact is recorded per compilation, re-checked atomically at commit,
//! and turned into runtime assumptions; when a later class load breaks a
//! fact, the guard sites that relied on it are patched to their slow paths.
//!
//! # Quick Start
//!
//! ```no_run
//! use devirt::prelude::*;
//!
//! fn main() -> devirt::Result<()> {
//!     let runtime = JitRuntime::new(JitOptions::default());
//!     runtime.load_class(ClassDescriptor::new(ClassId(1), "Object"), &NoClassSource)?;
//!     runtime.load_class(
//!         ClassDescriptor::new(ClassId(2), "Shape").method(MethodId(20), "area()D"),
//!         &NoClassSource,
//!     )?;
//!
//!     let mut compilation = runtime.begin_compilation(None)?;
//!     let site = CallSite::virtual_call(ClassId(2), "area()D");
//!     if let Some(selection) = compilation.select_guard(&site, &ClassProfile::new()) {
//!         println!("guard: {}", selection.guard);
//!     }
//!     let committed = compilation.commit().is_ok();
//!     println!("committed: {}", committed);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! Facts flow: [`selector`] / [`casts`] → [`ledger`] → [`commit`] → [`assumptions`] → [`code`] patches
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Model** | [`ids`], [`hierarchy`], [`profile`] |
//! | **Compilation** | [`selector`], [`casts`], [`guard`], [`ledger`] |
//! | **Commit and invalidation** | [`commit`], [`assumptions`], [`code`] |
//! | **Runtime** | [`runtime`], [`config`], [`scenario`] |

pub mod assumptions;
pub mod casts;
pub mod code;
pub mod commit;
pub mod config;
pub mod guard;
pub mod hierarchy;
pub mod ids;
pub mod ledger;
pub mod prelude;
pub mod profile;
pub mod runtime;
pub mod scenario;
pub mod selector;

mod error;

pub use config::JitOptions;
pub use error::{Error, IdentityKind, Result};
pub use runtime::{Compilation, JitRuntime, RuntimeEvent};

/// devirt version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
