//! Dependency graph over plan units, with wave computation.
//!
//! A wave is the set of units whose dependencies are all satisfied by
//! earlier waves: `wave(u) = 1 + max(wave(d))` over the dependencies, and 0
//! for units with none. Waves are computed, never stored.

use std::collections::HashMap;

use crate::errors::EngineError;
use crate::plan::schema::{Plan, Unit, UnitStatus};

#[derive(Debug, Clone)]
pub struct TaskGraph {
    units: Vec<Unit>,
    index: HashMap<String, usize>,
    pub goal: String,
    pub additional_context: String,
}

impl TaskGraph {
    /// Build a graph from a plan, rejecting malformed dependency relations
    /// (missing units, duplicates, cycles) before anything executes.
    pub fn build(plan: Plan) -> Result<Self, EngineError> {
        plan.validate()?;

        let index: HashMap<String, usize> = plan
            .units
            .iter()
            .enumerate()
            .map(|(i, u)| (u.id.clone(), i))
            .collect();

        let graph = Self {
            units: plan.units,
            index,
            goal: plan.goal,
            additional_context: plan.additional_context,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Kahn's algorithm; any unit left unprocessed sits on a cycle.
    fn check_acyclic(&self) -> Result<(), EngineError> {
        let mut in_degree: HashMap<&str, usize> = self
            .units
            .iter()
            .map(|u| (u.id.as_str(), u.depends_on.len()))
            .collect();
        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut processed = 0usize;

        while let Some(id) = queue.pop() {
            processed += 1;
            for unit in &self.units {
                if unit.depends_on.iter().any(|d| d == id) {
                    let degree = in_degree.get_mut(unit.id.as_str()).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(unit.id.as_str());
                    }
                }
            }
        }

        if processed < self.units.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(EngineError::graph(format!(
                "dependency cycle involving: {}",
                stuck.join(", ")
            )));
        }
        Ok(())
    }

    /// Group unit ids into execution waves, preserving plan order within a
    /// wave.
    pub fn waves(&self) -> Vec<Vec<String>> {
        let mut wave_of: HashMap<&str, usize> = HashMap::new();

        // Units are acyclic, so repeated passes converge in at most n
        // iterations.
        let mut changed = true;
        while changed {
            changed = false;
            for unit in &self.units {
                if wave_of.contains_key(unit.id.as_str()) {
                    continue;
                }
                if unit.depends_on.is_empty() {
                    wave_of.insert(unit.id.as_str(), 0);
                    changed = true;
                    continue;
                }
                let deps: Option<Vec<usize>> = unit
                    .depends_on
                    .iter()
                    .map(|d| wave_of.get(d.as_str()).copied())
                    .collect();
                if let Some(deps) = deps {
                    let wave = 1 + deps.into_iter().max().unwrap_or(0);
                    wave_of.insert(unit.id.as_str(), wave);
                    changed = true;
                }
            }
        }

        let max_wave = wave_of.values().copied().max().unwrap_or(0);
        let mut waves = vec![Vec::new(); max_wave + 1];
        for unit in &self.units {
            waves[wave_of[unit.id.as_str()]].push(unit.id.clone());
        }
        waves
    }

    pub fn unit(&self, id: &str) -> Option<&Unit> {
        self.index.get(id).map(|&i| &self.units[i])
    }

    pub fn unit_mut(&mut self, id: &str) -> Option<&mut Unit> {
        self.index.get(id).map(|&i| &mut self.units[i])
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// True when every dependency of `id` has succeeded.
    pub fn deps_satisfied(&self, id: &str) -> bool {
        self.unit(id)
            .map(|u| {
                u.depends_on.iter().all(|d| {
                    self.unit(d)
                        .map(|dep| dep.status == UnitStatus::Succeeded)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    /// True when some dependency of `id` ended failed or skipped.
    pub fn has_failed_dep(&self, id: &str) -> bool {
        self.unit(id)
            .map(|u| {
                u.depends_on.iter().any(|d| {
                    self.unit(d)
                        .map(|dep| {
                            matches!(dep.status, UnitStatus::Failed | UnitStatus::Skipped)
                        })
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }
}
