//! CLI command implementations.
//!
//! | Module    | Commands handled   |
//! |-----------|--------------------|
//! | `project` | `Init`             |
//! | `plan`    | `Plan`             |
//! | `run`     | `Run`              |
//! | `audit`   | `Audit`            |
//! | `config`  | `Config`           |

pub mod audit;
pub mod config;
pub mod plan;
pub mod project;
pub mod run;

pub use audit::cmd_audit;
pub use config::cmd_config;
pub use plan::cmd_plan;
pub use project::cmd_init;
pub use run::cmd_run;
