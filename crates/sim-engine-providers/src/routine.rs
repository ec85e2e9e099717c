//! Deterministic fallback decision used once model dispatch exhausts its
//! retries. Grounded on the resource/job pairing in
//! `original_source/backend/app/services/actions.py`'s `WORK_YIELDS` table
//! (reused from `sim_engine_types::WorkJob`), not on any LLM call.

use sim_engine_types::{Action, ResourceType, WorkJob};

/// Snapshot of an agent's held resources, used only to pick the scarcest
/// one — the dispatch layer builds this from `agent_inventory` rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct InventorySnapshot {
    pub food: f64,
    pub energy: f64,
    pub materials: f64,
}

impl InventorySnapshot {
    pub fn amount(self, resource: ResourceType) -> f64 {
        match resource {
            ResourceType::Food => self.food,
            ResourceType::Energy => self.energy,
            ResourceType::Materials => self.materials,
        }
    }
}

/// Ample-inventory threshold: idle rather than work if every resource is at
/// or above this level.
pub const AMPLE_THRESHOLD: f64 = 5.0;

pub struct RoutineExecutor;

impl RoutineExecutor {
    /// Idle if every resource is ample, otherwise work the job that produces
    /// the scarcest held resource.
    pub fn decide(inventory: InventorySnapshot) -> Action {
        let jobs = [WorkJob::Farm, WorkJob::Generate, WorkJob::Gather];
        let ample = jobs
            .iter()
            .all(|job| inventory.amount(job.resource()) >= AMPLE_THRESHOLD);
        if ample {
            return Action::Idle;
        }

        let scarcest = jobs
            .into_iter()
            .min_by(|a, b| {
                inventory
                    .amount(a.resource())
                    .partial_cmp(&inventory.amount(b.resource()))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(WorkJob::Farm);
        Action::Work { job: scarcest }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idles_when_every_resource_is_ample() {
        let snapshot = InventorySnapshot {
            food: 10.0,
            energy: 10.0,
            materials: 10.0,
        };
        assert!(matches!(RoutineExecutor::decide(snapshot), Action::Idle));
    }

    #[test]
    fn works_the_scarcest_resource() {
        let snapshot = InventorySnapshot {
            food: 1.0,
            energy: 10.0,
            materials: 10.0,
        };
        let action = RoutineExecutor::decide(snapshot);
        assert!(matches!(action, Action::Work { job: WorkJob::Farm }));
    }
}
