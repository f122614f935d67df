//! The digest stage DAG.
//!
//! Stages are plain values with declared dependencies, inputs, and
//! outputs. The runtime validates the graph once at construction (no
//! duplicates, no cycles, every dependency exists, stable topological
//! order) and then executes it as data. A stage receives only what it
//! declared and may write only what it declared; violations fail the run
//! with `ContractViolation`. Other stage failures degrade: the stage
//! contributes a warning and its outputs stay at their safe defaults.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Features;
use crate::digest::context::DigestContext;
use crate::digest::enrich::GreetingSource;
use crate::digest::links::LinkBuilder;
use crate::error::CoreError;
use crate::llm::adapter::LlmAdapter;

/// Collaborators a stage may use. Optional seams stay optional: a
/// missing adapter or greeting source degrades, never fails.
pub struct StageDeps {
    pub adapter: Option<Arc<LlmAdapter>>,
    pub features: Arc<Features>,
    pub greeting_source: Option<Arc<dyn GreetingSource>>,
    pub links: LinkBuilder,
}

pub type StageFuture<'a> = Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send + 'a>>;
pub type StageFn = for<'a> fn(&'a mut DigestContext, &'a StageDeps) -> StageFuture<'a>;

pub struct Stage {
    pub name: &'static str,
    pub depends_on: &'static [&'static str],
    pub inputs: &'static [&'static str],
    pub outputs: &'static [&'static str],
    pub run: StageFn,
}

pub struct Pipeline {
    stages: Vec<Stage>,
    order: Vec<usize>,
}

impl Pipeline {
    /// Validate the graph and fix the execution order.
    pub fn new(stages: Vec<Stage>) -> Result<Self, CoreError> {
        let mut names = BTreeSet::new();
        for stage in &stages {
            if !names.insert(stage.name) {
                return Err(CoreError::ContractViolation(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
        }
        for stage in &stages {
            for dep in stage.depends_on {
                if !names.contains(dep) {
                    return Err(CoreError::ContractViolation(format!(
                        "stage {} depends on unknown stage {}",
                        stage.name, dep
                    )));
                }
            }
        }

        let order = topological_order(&stages)?;
        Ok(Self { stages, order })
    }

    /// Execute in topological order, enforcing the slot contract around
    /// every stage.
    pub async fn run(&self, ctx: &mut DigestContext, deps: &StageDeps) -> Result<(), CoreError> {
        for &idx in &self.order {
            let stage = &self.stages[idx];

            for input in stage.inputs {
                if !ctx.is_filled(input) {
                    return Err(CoreError::ContractViolation(format!(
                        "stage {} requires unfilled slot {}",
                        stage.name, input
                    )));
                }
            }

            let before = ctx.filled_slots();
            let started = Instant::now();
            let result = (stage.run)(ctx, deps).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            ctx.stage_timings.push((stage.name.to_string(), elapsed_ms));

            match result {
                Ok(()) => {}
                Err(e @ CoreError::ContractViolation(_)) => return Err(e),
                Err(e) => {
                    // Degrade: keep going with safe defaults.
                    tracing::warn!(stage = stage.name, code = e.code(), "stage degraded");
                    ctx.warnings.push(format!("{}: {}", stage.name, e.code()));
                }
            }

            // A stage that finished (or degraded) owns its outputs now.
            for output in stage.outputs {
                ctx.mark_filled(output);
            }
            let after = ctx.filled_slots();
            for newly in after.difference(&before) {
                if !stage.outputs.contains(newly) {
                    return Err(CoreError::ContractViolation(format!(
                        "stage {} wrote undeclared slot {}",
                        stage.name, newly
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.order.iter().map(|&i| self.stages[i].name).collect()
    }
}

/// Kahn's algorithm, declaration-stable: among ready stages, the one
/// declared first runs first, so the order is deterministic.
fn topological_order(stages: &[Stage]) -> Result<Vec<usize>, CoreError> {
    let index_of: BTreeMap<&str, usize> =
        stages.iter().enumerate().map(|(i, s)| (s.name, i)).collect();

    let mut in_degree = vec![0usize; stages.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (i, stage) in stages.iter().enumerate() {
        for dep in stage.depends_on {
            let d = index_of[dep];
            in_degree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut order = Vec::with_capacity(stages.len());
    let mut ready: Vec<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
    while let Some(&next) = ready.first() {
        ready.remove(0);
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                // Insert keeping declaration order.
                let pos = ready.partition_point(|&r| r < dependent);
                ready.insert(pos, dependent);
            }
        }
    }

    if order.len() != stages.len() {
        return Err(CoreError::ContractViolation("stage graph has a cycle".to_string()));
    }
    Ok(order)
}
