//! Per-stream state machine gating conversion vs. passthrough.
//!
//! ```text
//! Idle -> Negotiating -> Passthrough | Converting -> Idle        (close)
//!                        Passthrough | Converting -> Negotiating (format change)
//! ```

use crate::engine::error::{PipelineError, Result};
use crate::engine::negotiate::ConversionPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    Idle,
    Negotiating,
    Passthrough,
    Converting,
}

#[derive(Debug)]
pub struct PassthroughSwitch {
    state: SwitchState,
    plan: Option<ConversionPlan>,
}

impl Default for PassthroughSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl PassthroughSwitch {
    pub fn new() -> Self {
        Self {
            state: SwitchState::Idle,
            plan: None,
        }
    }

    pub fn state(&self) -> SwitchState {
        self.state
    }

    /// Plan of the active stream, `None` unless passing or converting.
    pub fn plan(&self) -> Option<ConversionPlan> {
        self.plan
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SwitchState::Passthrough | SwitchState::Converting)
    }

    /// Idle -> Negotiating, when a stream opens.
    pub fn open(&mut self) -> Result<()> {
        match self.state {
            SwitchState::Idle => {
                self.state = SwitchState::Negotiating;
                Ok(())
            }
            other => Err(invalid("open", other)),
        }
    }

    /// Active -> Negotiating, when the producer changes format.
    ///
    /// Buffers queued under the old format must be invalidated by the caller.
    pub fn format_changed(&mut self) -> Result<()> {
        if !self.is_active() {
            return Err(invalid("change format", self.state));
        }
        self.state = SwitchState::Negotiating;
        self.plan = None;
        Ok(())
    }

    /// Negotiating -> Passthrough | Converting.
    pub fn resolve(&mut self, plan: ConversionPlan) -> Result<()> {
        if self.state != SwitchState::Negotiating {
            return Err(invalid("resolve", self.state));
        }
        self.state = match plan {
            ConversionPlan::Passthrough => SwitchState::Passthrough,
            ConversionPlan::Identity | ConversionPlan::Resample(_) => SwitchState::Converting,
        };
        self.plan = Some(plan);
        Ok(())
    }

    /// Back to Idle from any state. Idempotent.
    pub fn close(&mut self) {
        self.state = SwitchState::Idle;
        self.plan = None;
    }
}

fn invalid(action: &str, state: SwitchState) -> PipelineError {
    PipelineError::InvalidState(format!("cannot {action} while {state:?}"))
}
