//! Weight-shift schedule validation.
//!
//! A schedule is an ordered list of `(weight, bake)` stages. Weights must
//! be non-decreasing and end at 100: confidence only ever grows during a
//! rollout, and reducing exposure mid-flight is modeled as a rollback,
//! not a stage.

use gantry_state::Stage;

use crate::error::RolloutError;

/// Validate a schedule before admission. No side effects on failure.
pub fn validate(stages: &[Stage]) -> Result<(), RolloutError> {
    if stages.is_empty() {
        return Err(RolloutError::InvalidSchedule("schedule is empty".to_string()));
    }

    let mut previous = 0u8;
    for (index, stage) in stages.iter().enumerate() {
        if stage.weight > 100 {
            return Err(RolloutError::InvalidSchedule(format!(
                "stage {index} weight {} exceeds 100",
                stage.weight
            )));
        }
        if stage.weight < previous {
            return Err(RolloutError::InvalidSchedule(format!(
                "stage {index} weight {} decreases from {previous}",
                stage.weight
            )));
        }
        previous = stage.weight;
    }

    let last = stages.last().expect("non-empty").weight;
    if last != 100 {
        return Err(RolloutError::InvalidSchedule(format!(
            "final stage weight is {last}, must be 100"
        )));
    }

    Ok(())
}

/// Build a schedule from `(weight, bake_secs)` pairs.
pub fn stages(pairs: &[(u8, u64)]) -> Vec<Stage> {
    pairs
        .iter()
        .map(|&(weight, bake_secs)| Stage { weight, bake_secs })
        .collect()
}
