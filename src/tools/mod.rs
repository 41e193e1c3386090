//! Worked `ToolRunner` examples (§4.6): a calculator and a bash shell.
//! Concrete tool and agent implementations are out of scope for this
//! crate's core; these two exist only to exercise `TaskQueueManager`
//! end-to-end in this crate's own integration tests.

pub mod bash;
pub mod calculator;

pub use bash::{BashError, BashResult, BashTool, Platform};
pub use calculator::{Calculator, CalculatorError, CalculatorResult};
