//! JSON-described scenarios
//!
//! A scenario lists classes to load and then replays steps against one
//! [`JitRuntime`]: compilations (guard selections, cast plans, recorded
//! facts, commit or abort) and loader/VM events. The CLI prints the report;
//! tests assert on it.
//!
//! ```json
//! {
//!   "classes": [{ "id": 1, "name": "Object" }, { "id": 2, "name": "Shape", "methods": [...] }],
//!   "steps": [
//!     { "compile": { "name": "draw loop", "calls": [{ "site": {...}, "profile": [] }] } },
//!     { "event": { "kind": "class_extended", "superclass": 2, "subclass": 9 } }
//!   ]
//! }
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::assumptions::{AssumptionStats, NotifyReport};
use crate::casts::{CastClassRef, CastOp, CastPlan, CastRequest, CastTestPlanner};
use crate::commit::{CommitError, CommitSummary};
use crate::config::JitOptions;
use crate::error::{Error, Result};
use crate::hierarchy::{ClassDescriptor, ClassPool};
use crate::ids::{ClassId, MethodId};
use crate::profile::ClassProfile;
use crate::runtime::{JitRuntime, RuntimeEvent};
use crate::selector::CallSite;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStep {
    pub site: CallSite,
    #[serde(default)]
    pub profile: ClassProfile,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileStep {
    pub name: String,
    pub method: Option<MethodId>,
    pub calls: Vec<CallStep>,
    pub casts: Vec<CastRequest>,
    pub not_extended: Vec<ClassId>,
    pub not_newly_extended: Vec<ClassId>,
    pub not_overridden: Vec<MethodId>,
    /// Drop the compilation instead of committing it
    pub abort: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Compile(CompileStep),
    Event(RuntimeEvent),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub options: Option<JitOptions>,
    #[serde(default)]
    pub classes: Vec<ClassDescriptor>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// What one compile step produced
#[derive(Debug)]
pub struct CompileOutcome {
    pub name: String,
    pub guards: Vec<String>,
    pub cast_plans: Vec<CastPlan>,
    /// `None` when the step aborted
    pub commit: Option<std::result::Result<CommitSummary, CommitError>>,
}

#[derive(Debug)]
pub struct EventOutcome {
    pub event: RuntimeEvent,
    pub report: NotifyReport,
}

#[derive(Debug, Default)]
pub struct ScenarioReport {
    pub compilations: Vec<CompileOutcome>,
    pub events: Vec<EventOutcome>,
    /// Human readable trace in step order
    pub log: Vec<String>,
    pub stats: AssumptionStats,
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.log {
            writeln!(f, "{}", line)?;
        }
        write!(f, "{}", self.stats)
    }
}

impl Scenario {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::scenario(format!("Failed to parse scenario: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    fn pool(&self) -> ClassPool {
        let mut pool = ClassPool::new();
        for class in &self.classes {
            pool.add(class.clone());
        }
        pool
    }

    /// A runtime with every scenario class loaded
    pub fn boot(&self, options: JitOptions) -> Result<Arc<JitRuntime>> {
        let runtime = JitRuntime::new(options);
        let pool = self.pool();
        {
            let mut state = runtime.lock();
            // supertypes may already have come in through the pool
            for class in &self.classes {
                if state.hierarchy.find_class_info(class.id).is_none() {
                    state.load_class(class.clone(), &pool)?;
                }
            }
        }
        Ok(runtime)
    }

    /// Run with the scenario's own options, or the defaults
    pub fn run(&self) -> Result<ScenarioReport> {
        self.run_with(self.options.clone().unwrap_or_default())
    }

    pub fn run_with(&self, options: JitOptions) -> Result<ScenarioReport> {
        let runtime = self.boot(options)?;
        let mut report = ScenarioReport::default();
        report.log.push(format!("loaded {} classes", runtime.lock().hierarchy.len()));

        for step in &self.steps {
            match step {
                Step::Compile(compile) => {
                    let outcome = run_compile(&runtime, compile)?;
                    log_compile(&mut report.log, &outcome);
                    report.compilations.push(outcome);
                }
                Step::Event(event) => {
                    let notify = runtime.handle_event(event.clone())?;
                    report.log.push(format!(
                        "event {:?}: fired {} patched {} invalidated {:?}",
                        event, notify.fired, notify.patched, notify.invalidated
                    ));
                    report.events.push(EventOutcome {
                        event: event.clone(),
                        report: notify,
                    });
                }
            }
        }

        report.stats = runtime.stats();
        info!(
            compilations = report.compilations.len(),
            events = report.events.len(),
            live = report.stats.live(),
            "scenario finished"
        );
        Ok(report)
    }

    /// Plan a cast against the scenario's classes, by class name
    pub fn plan_cast(&self, options: JitOptions, class_name: &str, op: CastOp, may_be_null: bool) -> Result<CastPlan> {
        let runtime = self.boot(options)?;
        let state = runtime.lock();
        let class = state
            .hierarchy
            .find_class_by_name(class_name)
            .ok_or_else(|| Error::scenario(format!("no class named {}", class_name)))?;
        let mut request = CastRequest::new(op, CastClassRef::Resolved(class));
        request.object.may_be_null = may_be_null;
        Ok(CastTestPlanner::new(&state.hierarchy, runtime.options()).plan(&request))
    }
}

fn run_compile(runtime: &Arc<JitRuntime>, step: &CompileStep) -> Result<CompileOutcome> {
    let mut compilation = runtime.begin_compilation(step.method)?;
    for &class in &step.not_extended {
        compilation.record_class_not_extended(class);
    }
    for &class in &step.not_newly_extended {
        compilation.record_class_not_newly_extended(class);
    }
    for &method in &step.not_overridden {
        compilation.record_method_not_overridden(method)?;
    }

    let mut guards = Vec::new();
    for call in &step.calls {
        match compilation.select_guard(&call.site, &call.profile) {
            Some(selection) => guards.push(format!("{} -> {}", selection.guard, selection.target)),
            None => guards.push(format!("{}: dispatch", call.site.selector)),
        }
    }
    let cast_plans = step.casts.iter().map(|c| compilation.plan_cast(c)).collect();

    let commit = if step.abort {
        compilation.abort();
        None
    } else {
        Some(compilation.commit())
    };
    Ok(CompileOutcome {
        name: step.name.clone(),
        guards,
        cast_plans,
        commit,
    })
}

fn log_compile(log: &mut Vec<String>, outcome: &CompileOutcome) {
    log.push(format!("compile {}", outcome.name));
    for guard in &outcome.guards {
        log.push(format!("  guard {}", guard));
    }
    for plan in &outcome.cast_plans {
        log.push(format!("  cast {}", plan));
    }
    log.push(match &outcome.commit {
        None => "  aborted".to_string(),
        Some(Ok(s)) => format!(
            "  committed body {} ({} assumptions, {} pre-existence, {} compensated)",
            s.body, s.registered, s.preexistence, s.compensated
        ),
        Some(Err(e)) => format!("  commit failed: {}", e),
    });
}
