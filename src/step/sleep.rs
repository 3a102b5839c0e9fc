//! The `sleep` step: waits for `duration` seconds, or until the test is stopped.

use std::time::Duration;

use serde_json::{Map, Value};
use tokio::select;

use super::{Step, StepContext, StepError};
use crate::result::StepResult;
use crate::suite::StepSpec;

pub const KIND: &str = "sleep";

#[derive(Debug)]
pub struct SleepStep {
    name: String,
    fields: Map<String, Value>,
    duration: Duration,
}

impl SleepStep {
    pub fn new(spec: &StepSpec, name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: spec.fields.clone(),
            duration: Duration::ZERO,
        }
    }
}

impl Step for SleepStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        KIND
    }

    fn setup(&mut self, ctx: &StepContext) -> Result<(), StepError> {
        self.duration = ctx
            .duration_field(&self.fields, "duration")?
            .ok_or_else(|| StepError::invalid(&self.name, "'duration' is required"))?;
        Ok(())
    }

    fn run(&mut self, ctx: &StepContext) -> Result<StepResult, StepError> {
        let duration = self.duration;
        Ok(ctx.runtime.block_on(async {
            select! {
                _ = tokio::time::sleep(duration) => StepResult::pass(),
                _ = ctx.cancel.cancelled() => StepResult::incomplete("interrupted"),
            }
        }))
    }
}
