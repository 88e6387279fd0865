pub mod round;
pub mod session;

pub use round::{AgentOutput, Direction, RoundRecord, StepId, StepRecord};
pub use session::{SessionKind, SessionState, SessionStatus};
