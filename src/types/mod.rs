mod artifacts;
mod budget;
mod circuit_breaker;
mod eval;
mod events;
mod failure;
mod identifiers;
mod quarantine;
mod requests;
mod retry;
mod run;
mod step;

pub use artifacts::{ApprovalGate, ApprovalStatus, CaseScore, DiffArtifact, EvalReport};
pub use budget::{BudgetDimension, BudgetLimits, BudgetRemaining, BudgetUsage};
pub use circuit_breaker::{BreakerKey, CircuitBreakerRecord, CircuitConfig, CircuitState};
pub use eval::{Assertion, CaseRunRecord, EvalCase, EvalSuite};
pub use events::{ReplanRequest, RunEvent, RunEventKind};
pub use failure::{FailureSignal, FailureType, Severity, RETRY_AFTER_SECONDS};
pub use identifiers::{CaseId, PlanId, QuarantineId, ReviewerId, RunId, SpecId, SuiteId, TenantId};
pub use quarantine::{CaseKey, QuarantineCase, QuarantineGating, QuarantineStatus};
pub use requests::{RunStatusView, StepCompletion, SubmitBuild, SubmitReceipt};
pub use retry::RetryState;
pub use run::{BuildRun, RunFailureReason, RunStatus};
pub use step::{BuildStep, StepName, StepStatus};
