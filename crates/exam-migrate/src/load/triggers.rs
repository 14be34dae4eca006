//! Trigger suspension around the large user test and answer loads.

use crate::error::Result;
use crate::store::{
    RecomputePass, TargetStore, PASS_ANSWER_CORRECTNESS, PASS_FINALIZE_USER_TESTS,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Non-essential triggers disabled while user tests and answers are loaded.
pub const SUSPENDED_TRIGGERS: [(&str, &str); 5] = [
    ("user_tests", "trigger_update_daily_activity_and_streak"),
    ("user_test_answers", "trg_calculate_answer_correctness"),
    ("user_test_answers", "trg_update_flashcard_review_schedule"),
    ("user_test_answers", "trg_update_question_stats"),
    ("user_test_answers", "trg_update_user_test_stats"),
];

/// Marks scored tests finalized. Runs after the triggers are back so the
/// ranking and streak triggers fire once per test.
pub fn finalize_pass() -> RecomputePass {
    RecomputePass {
        name: PASS_FINALIZE_USER_TESTS.to_string(),
        sql: "UPDATE user_tests SET finalized = true WHERE score IS NOT NULL".to_string(),
    }
}

/// Recomputes `correct` for every answer in one statement.
pub fn correctness_pass() -> RecomputePass {
    let expr = "(uta.selected_option_id IS NOT NULL AND EXISTS (\
        SELECT 1 FROM question_options qo \
        WHERE qo.id = uta.selected_option_id AND qo.is_correct = true))";
    RecomputePass {
        name: PASS_ANSWER_CORRECTNESS.to_string(),
        sql: format!(
            "UPDATE user_test_answers uta SET correct = {expr} \
             WHERE uta.correct IS NULL OR uta.correct IS DISTINCT FROM {expr}"
        ),
    }
}

/// Disables a fixed trigger set and guarantees it is re-enabled.
pub struct TriggerSuspension {
    target: Arc<dyn TargetStore>,
    triggers: Vec<(String, String)>,
    active: bool,
}

impl TriggerSuspension {
    pub fn new(target: Arc<dyn TargetStore>) -> Self {
        Self {
            target,
            triggers: SUSPENDED_TRIGGERS
                .iter()
                .map(|(t, n)| (t.to_string(), n.to_string()))
                .collect(),
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Disable every trigger. On a partial failure the ones already
    /// disabled are restored before returning the error.
    pub async fn suspend(&mut self) -> Result<()> {
        info!("Suspending {} triggers", self.triggers.len());
        self.active = true;
        for (table, trigger) in &self.triggers {
            if let Err(e) = self.target.set_trigger(table, trigger, false).await {
                error!("Failed to disable {}.{}: {}", table, trigger, e);
                self.restore().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Re-enable every trigger. Best effort: failures are logged and the
    /// remaining triggers are still attempted. Returns true when all succeeded.
    pub async fn restore(&mut self) -> bool {
        if !self.active {
            return true;
        }
        let mut ok = true;
        for (table, trigger) in &self.triggers {
            if let Err(e) = self.target.set_trigger(table, trigger, true).await {
                error!("Failed to re-enable {}.{}: {}", table, trigger, e);
                ok = false;
            }
        }
        self.active = false;
        if ok {
            info!("Triggers re-enabled");
        }
        ok
    }

    /// Run the finalize and correctness passes; returns rows affected.
    pub async fn finalize(&self) -> Result<u64> {
        let mut total = 0;
        for pass in [finalize_pass(), correctness_pass()] {
            let affected = self.target.run_pass(&pass).await?;
            info!("Recompute pass {}: {} rows", pass.name, affected);
            total += affected;
        }
        Ok(total)
    }
}

impl Drop for TriggerSuspension {
    fn drop(&mut self) {
        if self.active {
            warn!("Trigger suspension dropped while active; triggers may still be disabled");
        }
    }
}
