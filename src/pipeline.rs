//! Ordered step pipeline with fatal / warning severities.
//!
//! The step list is data: each [`Step`] carries its name, its severity and
//! its action. One driver loop ([`Pipeline::run`]) walks the list in order:
//!
//! - a step that succeeds is logged as `SUCCESS`;
//! - a failing [`Severity::Warning`] step is logged as `WARNING` and the loop
//!   moves on to the next step;
//! - a failing [`Severity::Fatal`] step is logged as `ERROR` and the loop stops.
//!   Nothing is rolled back.
//!
//! Steps that a configuration disables are left out while the list is built,
//! so they never execute.

use std::fmt;

use crate::log::LogSink;

/// What a failing step does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Stop the pipeline.
    Fatal,
    /// Log and continue.
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Fatal => write!(f, "fatal"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Success,
    Failure(String),
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success)
    }
}

impl From<anyhow::Result<()>> for StepResult {
    fn from(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => StepResult::Success,
            Err(e) => StepResult::Failure(format!("{:#}", e)),
        }
    }
}

/// Anything a pipeline can run against. The driver logs through it.
pub trait PipelineContext {
    fn log(&mut self) -> &mut LogSink;
}

type Action<C> = Box<dyn Fn(&mut C) -> StepResult>;

pub struct Step<C> {
    name: &'static str,
    severity: Severity,
    action: Action<C>,
}

impl<C> Step<C> {
    pub fn new(
        name: &'static str,
        severity: Severity,
        action: impl Fn(&mut C) -> StepResult + 'static,
    ) -> Self {
        Self {
            name,
            severity,
            action: Box::new(action),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }
}

/// A step that failed, with the message it reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: &'static str,
    pub message: String,
}

/// What happened during a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Every step that was started, in order.
    pub attempted: Vec<&'static str>,
    /// Warning steps that failed.
    pub warnings: Vec<StepFailure>,
    /// The fatal step that stopped the run, if any.
    pub fatal: Option<StepFailure>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
    }

    pub fn ran(&self, step: &str) -> bool {
        self.attempted.iter().any(|name| *name == step)
    }

    /// Process exit status for this run: 0 on success, 1 after a fatal step.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

pub struct Pipeline<C> {
    steps: Vec<Step<C>>,
}

impl<C> Default for Pipeline<C> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<C: PipelineContext> Pipeline<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn step(
        mut self,
        name: &'static str,
        severity: Severity,
        action: impl Fn(&mut C) -> StepResult + 'static,
    ) -> Self {
        self.steps.push(Step::new(name, severity, action));
        self
    }

    /// Append a step only when `enabled`.
    pub fn step_if(
        self,
        enabled: bool,
        name: &'static str,
        severity: Severity,
        action: impl Fn(&mut C) -> StepResult + 'static,
    ) -> Self {
        if enabled {
            self.step(name, severity, action)
        } else {
            self
        }
    }

    pub fn steps(&self) -> &[Step<C>] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order, stopping at the first fatal failure.
    pub fn run(&self, ctx: &mut C) -> RunReport {
        let mut report = RunReport::default();
        let total = self.steps.len();

        for (index, step) in self.steps.iter().enumerate() {
            ctx.log()
                .info(format!("[{}/{}] {}", index + 1, total, step.name));
            report.attempted.push(step.name);

            match (step.action)(ctx) {
                StepResult::Success => {
                    ctx.log().success(format!("{} completed", step.name));
                }
                StepResult::Failure(message) => match step.severity {
                    Severity::Warning => {
                        ctx.log()
                            .warning(format!("{} failed (continuing): {}", step.name, message));
                        report.warnings.push(StepFailure {
                            step: step.name,
                            message,
                        });
                    }
                    Severity::Fatal => {
                        ctx.log().error(format!("{} failed: {}", step.name, message));
                        report.fatal = Some(StepFailure {
                            step: step.name,
                            message,
                        });
                        break;
                    }
                },
            }
        }

        report
    }
}
