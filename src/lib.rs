// Photo Migrator - Library Entry Point

pub mod albums;
pub mod archive;
pub mod config;
pub mod constants;
pub mod destination;
pub mod error;
pub mod hash;
pub mod ledger;
pub mod logging;
pub mod metadata;
pub mod orchestrator;
pub mod remote;
pub mod tools;
pub mod wait;
pub mod workdir;

pub use error::{MigrateError, Result};
pub use orchestrator::{Orchestrator, RunContext, RunMode, RunSummary, UnitOutcome};
