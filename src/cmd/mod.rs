//! CLI command implementations.
//!
//! | Module   | Commands handled     |
//! |----------|----------------------|
//! | `build`  | `Start`, `Resume`    |
//! | `status` | `Status`, `Phases`   |
//!
//! Every command returns the process exit code on success; `Err` is reported
//! by `main` as a fatal error.

pub mod build;
pub mod status;

pub use build::{cmd_resume, cmd_start};
pub use status::{cmd_phases, cmd_status};
