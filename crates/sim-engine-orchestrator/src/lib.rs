pub mod action_engine;
pub mod context;
pub mod epoch_tournament;
pub mod processor;
pub mod run_reports;
pub mod scheduler;
pub mod season_transfer;

pub use action_engine::{validate_and_execute, ExecutionResult, ValidationOutcome};
pub use context::ContextBuilder;
pub use epoch_tournament::{select_epoch_tournament_candidates, TournamentSelection};
pub use processor::{AgentProcessor, TurnOutcome};
pub use run_reports::{export_run_report, generate_next_run_plan, rebuild_run_bundle, RunReportArtifact};
pub use scheduler::Scheduler;
pub use season_transfer::{export_season_snapshot, seed_next_season, SeedResult, SnapshotResult};
