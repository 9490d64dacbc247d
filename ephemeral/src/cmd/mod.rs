mod check;
mod reap;
mod run;

pub use check::{CheckArgs, run_check};
pub use reap::{ReapArgs, run_reap};
pub use run::{RunArgs, run_run};
