//! CLI entry point for simulation control, season transfer, epoch
//! tournaments, and run reports. Grounded on
//! `iridite-tandem/engine/src/main.rs`'s clap-derive `Cli`/`Subcommand`
//! shape and `tracing_subscriber` init; the CLI argument names and defaults
//! below are reproduced from `original_source/backend/scripts/*.py`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use sim_engine_core::config::RuntimeConfigService;
use sim_engine_core::event_bus::EventBus;
use sim_engine_core::guardrail::{GuardrailService, PoolPressureSource, ProviderFailureSource};
use sim_engine_core::storage::{Storage, DEFAULT_POOL_SIZE};
use sim_engine_orchestrator::context::ContextBuilder;
use sim_engine_orchestrator::epoch_tournament::{
    select_epoch_tournament_candidates, DEFAULT_CHAMPIONS_PER_SEASON, DEFAULT_TARGET_CHAMPIONS,
    SCORING_POLICY_VERSION_V1,
};
use sim_engine_orchestrator::processor::AgentProcessor;
use sim_engine_orchestrator::run_reports::{export_run_report, generate_next_run_plan, rebuild_run_bundle};
use sim_engine_orchestrator::scheduler::Scheduler;
use sim_engine_orchestrator::season_transfer::{
    export_season_snapshot, seed_next_season, DEFAULT_TARGET_AGENT_COUNT, SURVIVOR_SNAPSHOT_TYPE_V1,
};
use sim_engine_providers::dispatch::ModelDispatchService;
use sim_engine_providers::registry::ProviderRegistry;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sim-enginectl")]
#[command(about = "Control plane for the agent simulation engine")]
struct Cli {
    /// Path to the SQLite database file.
    #[arg(long, global = true, default_value = "sim_engine.db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    SimulationControl {
        #[command(subcommand)]
        action: SimulationAction,
    },
    ExportSeasonSnapshot {
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value = SURVIVOR_SNAPSHOT_TYPE_V1)]
        snapshot_type: String,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    SeedNextSeason {
        #[arg(long)]
        season_id: String,
        #[arg(long)]
        parent_run_id: String,
        #[arg(long)]
        transfer_policy_version: String,
        #[arg(long, default_value_t = DEFAULT_TARGET_AGENT_COUNT)]
        target_agent_count: i64,
        #[arg(long, default_value_t = false)]
        carry_passed_laws: bool,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
    SelectEpochTournamentCandidates {
        #[arg(long)]
        epoch_id: String,
        #[arg(long = "season-id")]
        season_ids: Vec<String>,
        #[arg(long, default_value_t = DEFAULT_CHAMPIONS_PER_SEASON)]
        champions_per_season: i64,
        #[arg(long, default_value_t = DEFAULT_TARGET_CHAMPIONS)]
        target_total_champions: i64,
        #[arg(long, default_value = SCORING_POLICY_VERSION_V1)]
        scoring_policy_version: String,
        #[arg(long, default_value_t = false)]
        no_write: bool,
    },
    ExportRunReport {
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value = "")]
        condition: String,
        #[arg(long, default_value_t = 0)]
        season_number: i64,
    },
    GenerateNextRunPlan {
        #[arg(long)]
        run_id: String,
    },
    RebuildRunBundle {
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value = "")]
        condition: String,
        #[arg(long, default_value_t = 0)]
        season_number: i64,
        #[arg(long, default_value = "run-bundle-cli")]
        actor_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum SimulationAction {
    Start {
        #[arg(long)]
        run_id: String,
    },
    Stop,
    Status,
}

struct IdlePool;
impl PoolPressureSource for IdlePool {
    fn utilization(&self) -> f64 {
        0.0
    }
}

struct NoProviderFailures;
impl ProviderFailureSource for NoProviderFailures {
    fn failures_in_window(&self, _window_minutes: u64) -> u64 {
        0
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").with_target(false).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(output) => {
            println!("{output}");
            Ok(())
        }
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(2);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<String> {
    let storage = Arc::new(
        Storage::open(&cli.db_path, DEFAULT_POOL_SIZE)
            .await
            .with_context(|| format!("opening database at {}", cli.db_path.display()))?,
    );

    match cli.command {
        Command::SimulationControl { action } => run_simulation_control(storage, action).await,
        Command::ExportSeasonSnapshot {
            run_id,
            snapshot_type,
            dry_run,
        } => {
            let result = export_season_snapshot(&storage, &run_id, &snapshot_type, dry_run).await?;
            Ok(serde_json::to_string_pretty(&result)?)
        }
        Command::SeedNextSeason {
            season_id,
            parent_run_id,
            transfer_policy_version,
            target_agent_count,
            carry_passed_laws,
            dry_run,
            confirm,
        } => {
            let result = seed_next_season(
                &storage,
                &season_id,
                &parent_run_id,
                &transfer_policy_version,
                target_agent_count,
                carry_passed_laws,
                dry_run,
                confirm,
            )
            .await?;
            Ok(serde_json::to_string_pretty(&result)?)
        }
        Command::SelectEpochTournamentCandidates {
            epoch_id,
            season_ids,
            champions_per_season,
            target_total_champions,
            scoring_policy_version,
            no_write,
        } => {
            let cap = if target_total_champions <= 0 {
                None
            } else {
                Some(target_total_champions)
            };
            let result = select_epoch_tournament_candidates(
                &storage,
                &epoch_id,
                season_ids,
                champions_per_season,
                cap,
                &scoring_policy_version,
                !no_write,
            )
            .await?;
            Ok(serde_json::to_string_pretty(&result)?)
        }
        Command::ExportRunReport {
            run_id,
            condition,
            season_number,
        } => {
            let condition = non_empty(&condition);
            let season_number = positive(season_number);
            let artifact = export_run_report(&storage, &run_id, condition.as_deref(), season_number).await?;
            Ok(serde_json::to_string_pretty(&artifact)?)
        }
        Command::GenerateNextRunPlan { run_id } => {
            let artifact = generate_next_run_plan(&storage, &run_id).await?;
            Ok(serde_json::to_string_pretty(&artifact)?)
        }
        Command::RebuildRunBundle {
            run_id,
            condition,
            season_number,
            actor_id,
        } => {
            let condition = non_empty(&condition);
            let season_number = positive(season_number);
            let artifact =
                rebuild_run_bundle(&storage, &run_id, &actor_id, condition.as_deref(), season_number).await?;
            Ok(serde_json::to_string_pretty(&artifact)?)
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn positive(value: i64) -> Option<i64> {
    if value > 0 {
        Some(value)
    } else {
        None
    }
}

async fn run_simulation_control(storage: Arc<Storage>, action: SimulationAction) -> anyhow::Result<String> {
    let config = Arc::new(RuntimeConfigService::new(storage.clone()));
    match action {
        SimulationAction::Start { run_id } => {
            config
                .update_settings(
                    [
                        ("SIMULATION_ACTIVE".to_string(), serde_json::json!(true)),
                        ("SIMULATION_RUN_ID".to_string(), serde_json::json!(run_id)),
                    ]
                    .into_iter()
                    .collect(),
                    "sim-enginectl",
                    "simulation-control start",
                )
                .await?;
            info!(run_id = %run_id, "simulation started");
            run_agent_loop(storage, config, run_id).await
        }
        SimulationAction::Stop => {
            config
                .update_settings(
                    [("SIMULATION_ACTIVE".to_string(), serde_json::json!(false))]
                        .into_iter()
                        .collect(),
                    "sim-enginectl",
                    "simulation-control stop",
                )
                .await?;
            info!("simulation stop requested");
            Ok(serde_json::json!({"status": "stopped"}).to_string())
        }
        SimulationAction::Status => {
            let active = config.get_bool("SIMULATION_ACTIVE", true).await;
            let run_id = config.get_effective_value_cached("SIMULATION_RUN_ID").await;
            let agents_alive: i64 = storage
                .with_conn(|conn| conn.query_row("SELECT count(*) FROM agents WHERE status != 'dead'", [], |row| row.get(0)))
                .await?;
            Ok(serde_json::json!({
                "active": active,
                "run_id": run_id,
                "agents_alive": agents_alive,
            })
            .to_string())
        }
    }
}

/// Drives every active agent through one turn per pass, running the
/// scheduler's daily tick and resolvers every `SCHEDULER_PASS_INTERVAL`
/// passes, until `SIMULATION_ACTIVE` is cleared (by `stop`) or a guardrail
/// stop condition fires, or the process receives Ctrl-C.
async fn run_agent_loop(
    storage: Arc<Storage>,
    config: Arc<RuntimeConfigService>,
    run_id: String,
) -> anyhow::Result<String> {
    const SCHEDULER_PASS_INTERVAL: u64 = 50;

    let event_bus = Arc::new(EventBus::new());
    let guardrail = Arc::new(GuardrailService::new(
        config.clone(),
        event_bus.clone(),
        Arc::new(IdlePool),
        Arc::new(NoProviderFailures),
    ));
    let registry = Arc::new(ProviderRegistry::from_env());
    let dispatch = Arc::new(ModelDispatchService::new(registry, storage.clone(), 3));
    let context_builder = Arc::new(ContextBuilder::new(storage.clone(), config.clone()));
    let processor = Arc::new(AgentProcessor::new(
        storage.clone(),
        config.clone(),
        guardrail,
        dispatch,
        context_builder,
        event_bus,
        run_id.clone(),
    ));
    let scheduler = Scheduler::new(storage.clone(), Arc::new(EventBus::new()));

    let mut pass: u64 = 0;
    loop {
        if !config.get_bool("SIMULATION_ACTIVE", true).await {
            break;
        }

        let agent_ids: Vec<i64> = storage
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM agents WHERE status = 'active' ORDER BY agent_number ASC")?;
                let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
                rows.collect::<Result<Vec<_>, _>>()
            })
            .await?;

        if agent_ids.is_empty() {
            break;
        }

        for agent_id in agent_ids {
            let outcome = processor.process_turn(agent_id).await?;
            if outcome == sim_engine_orchestrator::processor::TurnOutcome::GuardrailStopped {
                return Ok(serde_json::json!({"status": "stopped", "reason": "guardrail"}).to_string());
            }
        }

        pass += 1;
        if pass % SCHEDULER_PASS_INTERVAL == 0 {
            scheduler.run_daily_tick().await?;
            scheduler.run_proposal_resolver().await?;
            scheduler.run_enforcement_resolver().await?;
            scheduler.run_emergence_metrics(pass as i64 / SCHEDULER_PASS_INTERVAL as i64).await?;
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
            _ = tokio::signal::ctrl_c() => {
                return Ok(serde_json::json!({"status": "interrupted", "passes": pass}).to_string());
            }
        }
    }

    Ok(serde_json::json!({"status": "stopped", "passes": pass}).to_string())
}
