pub mod audit;
pub mod commit;
pub mod component;
pub mod config;
pub mod errors;
pub mod graph;
pub mod health;
pub mod init;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod retry;
pub mod router;
pub mod worker;
