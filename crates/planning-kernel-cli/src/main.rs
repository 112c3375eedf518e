use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use planning_kernel_core::{
    compute_generation, convergence_delta, justify, resolve_consensus, top_entities, EntityCatalog,
    EntityClass, GenerationSnapshot, MatrixStore,
};
use planning_kernel_store_files::{FileStore, MatrixLoad};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "pk.v1";

#[derive(Debug, Parser)]
#[command(name = "pk")]
#[command(about = "Planning Kernel CLI")]
struct Cli {
    /// Planning directory holding the catalog, matrices, and step files.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Step {
        #[command(subcommand)]
        command: StepCommand,
    },
    Matrix {
        #[command(subcommand)]
        command: MatrixCommand,
    },
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
}

#[derive(Debug, Subcommand)]
enum StepCommand {
    Compute(StepComputeArgs),
    Show(StepShowArgs),
    Latest,
}

#[derive(Debug, Args)]
struct StepComputeArgs {
    #[arg(long)]
    generation: u32,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Debug, Args)]
struct StepShowArgs {
    #[arg(long)]
    generation: u32,
}

#[derive(Debug, Subcommand)]
enum MatrixCommand {
    Generate,
    Validate,
    Populate(MatrixPopulateArgs),
}

#[derive(Debug, Args)]
struct MatrixPopulateArgs {
    #[arg(long)]
    observations: PathBuf,
    #[arg(long, default_value_t = false)]
    show_counts: bool,
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    Top(ReportTopArgs),
}

#[derive(Debug, Args)]
struct ReportTopArgs {
    #[arg(long, default_value_t = 3)]
    count: usize,
    #[arg(long)]
    generation: Option<u32>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = FileStore::open(&cli.dir)?;
    match cli.command {
        Command::Step { command } => run_step(command, &store),
        Command::Matrix { command } => run_matrix(command, &store),
        Command::Report { command } => run_report(command, &store),
    }
}

fn run_step(command: StepCommand, store: &FileStore) -> Result<()> {
    match command {
        StepCommand::Compute(args) => run_step_compute(&args, store),
        StepCommand::Show(args) => {
            let snapshot = store.load_step(args.generation)?;
            emit_json(serde_json::to_value(&snapshot)?)
        }
        StepCommand::Latest => {
            let snapshot = store.latest_step()?;
            emit_json(serde_json::to_value(&snapshot)?)
        }
    }
}

fn load_everything(store: &FileStore) -> Result<(EntityCatalog, MatrixLoad)> {
    let catalog = store.load_catalog()?;
    let load = store.load_matrices(&catalog)?;
    Ok((catalog, load))
}

fn top_summary(
    catalog: &EntityCatalog,
    snapshot: &GenerationSnapshot,
    class: EntityClass,
    count: usize,
) -> Vec<Value> {
    top_entities(catalog, snapshot, class, count)
        .into_iter()
        .map(|(key, score)| serde_json::json!({ "key": key, "score": score }))
        .collect()
}

fn run_step_compute(args: &StepComputeArgs, store: &FileStore) -> Result<()> {
    let (catalog, load) = load_everything(store)?;

    let previous = if args.generation > 1 {
        let prior = args.generation - 1;
        Some(store.load_step(prior).with_context(|| {
            format!("generation {} requires generation {prior} to be computed first", args.generation)
        })?)
    } else {
        None
    };

    let mut snapshot =
        compute_generation(&catalog, &load.store, previous.as_ref(), args.generation)?;
    if let Some(description) = &args.description {
        snapshot.description.clone_from(description);
    }
    let path = store.save_step(&snapshot)?;

    let delta = previous.as_ref().map(|previous| convergence_delta(previous, &snapshot));
    emit_json(serde_json::json!({
        "generation": snapshot.generation,
        "file": path.display().to_string(),
        "cell_warnings": load.warnings,
        "convergence_delta": delta,
        "top_problems": top_summary(&catalog, &snapshot, EntityClass::Problem, 5),
        "top_needs": top_summary(&catalog, &snapshot, EntityClass::Need, 5),
        "top_features": top_summary(&catalog, &snapshot, EntityClass::Feature, 5),
    }))
}

fn run_matrix(command: MatrixCommand, store: &FileStore) -> Result<()> {
    match command {
        MatrixCommand::Generate => {
            let catalog = store.load_catalog()?;
            let written = store.scaffold_matrices(&catalog)?;
            emit_json(serde_json::json!({ "written": written }))
        }
        MatrixCommand::Validate => {
            let (_, load) = load_everything(store)?;
            emit_json(serde_json::json!({
                "valid": true,
                "cell_warnings": load.warnings,
            }))
        }
        MatrixCommand::Populate(args) => run_matrix_populate(&args, store),
    }
}

fn run_matrix_populate(args: &MatrixPopulateArgs, store: &FileStore) -> Result<()> {
    let catalog = store.load_catalog()?;
    let load = store.load_observations(&args.observations)?;
    let outcome = resolve_consensus(&catalog, &load.observations);
    let written = store.write_consensus_matrices(&catalog, &outcome, args.show_counts)?;

    let conflicts: Vec<Value> = outcome
        .cells
        .iter()
        .filter(|cell| cell.conflicted)
        .map(|cell| {
            serde_json::json!({
                "edge": cell.edge,
                "from": cell.from_key,
                "to": cell.to_key,
                "strength": cell.strength.weight(),
                "votes": cell.votes,
            })
        })
        .collect();

    emit_json(serde_json::json!({
        "observations": load.observations.len(),
        "line_warnings": load.warnings,
        "cells": outcome.cells.len(),
        "conflicts": conflicts,
        "skipped": outcome.skipped,
        "written": written,
    }))
}

fn run_report(command: ReportCommand, store: &FileStore) -> Result<()> {
    match command {
        ReportCommand::Top(args) => run_report_top(&args, store),
    }
}

fn run_report_top(args: &ReportTopArgs, store: &FileStore) -> Result<()> {
    let (catalog, load) = load_everything(store)?;
    let snapshot = match args.generation {
        Some(generation) => store.load_step(generation)?,
        None => store.latest_step()?,
    };

    let features = ranked_features(&catalog, &load.store, &snapshot, args.count)?;
    emit_json(serde_json::json!({
        "generation": snapshot.generation,
        "count": features.len(),
        "features": features,
    }))
}

fn ranked_features(
    catalog: &EntityCatalog,
    matrices: &MatrixStore,
    snapshot: &GenerationSnapshot,
    count: usize,
) -> Result<Vec<Value>> {
    let mut features = Vec::new();
    for (key, _) in top_entities(catalog, snapshot, EntityClass::Feature, count) {
        let report = justify(catalog, matrices, snapshot, EntityClass::Feature, &key)?;
        features.push(serde_json::to_value(&report)?);
    }
    Ok(features)
}
