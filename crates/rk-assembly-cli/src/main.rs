//! RK assembly solver command line host
//!
//! Loads an assembly scene, solves its constraints and writes the updated
//! poses back to the scene file (or `--output`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rk_assembly::{
    AssemblyError, AssemblyScene, AssemblySolver, SolveCache, SolveReport, SolveStatus,
    SolverConfig,
};

#[derive(Parser)]
#[command(name = "rk-assembly")]
#[command(about = "Solve rigid-body assembly constraints", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve the constraints of a scene file
    Solve {
        /// Scene file (RON)
        scene: PathBuf,

        /// Solver configuration (RON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Where to write the solved scene, defaults to the input file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Seed for the stagnation perturbation
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the default solver configuration
    DefaultConfig,
}

fn main() -> ExitCode {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rk_assembly=info,rk_assembly_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Solve {
            scene,
            config,
            output,
            json,
            seed,
        } => solve(scene, config, output, json, seed),
        Commands::DefaultConfig => SolverConfig::default().to_ron_string().map(|text| {
            println!("{text}");
            true
        }),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Run one solve, returning whether every constraint was satisfied
fn solve(
    scene_path: PathBuf,
    config_path: Option<PathBuf>,
    output: Option<PathBuf>,
    json: bool,
    seed: Option<u64>,
) -> rk_assembly::Result<bool> {
    let mut config = match &config_path {
        Some(path) => SolverConfig::load(path)?,
        None => SolverConfig::default(),
    };
    if let Some(seed) = seed {
        config = config.with_seed(seed);
    }

    let mut scene = AssemblyScene::load(&scene_path)?;
    tracing::info!(
        scene = %scene.name,
        bodies = scene.bodies.len(),
        constraints = scene.constraints.len(),
        "Loaded scene"
    );

    let mut cache = config.use_cache.then(SolveCache::new);
    let mut solver = AssemblySolver::new(config)?;
    let report = scene.solve(&mut solver, cache.as_mut())?;

    if report.is_solved() {
        let target = output.unwrap_or(scene_path);
        scene.save(&target)?;
        tracing::info!(path = %target.display(), "Saved scene");
    }

    if json {
        let text =
            serde_json::to_string_pretty(&report).map_err(|e| AssemblyError::Io(e.to_string()))?;
        println!("{text}");
    } else {
        print_report(&report);
    }

    Ok(report.is_solved())
}

fn print_report(report: &SolveReport) {
    match &report.status {
        SolveStatus::Solved => println!("solved"),
        SolveStatus::Failed {
            constraint,
            label,
            residual,
        } => println!("failed at {label} ({constraint}), residual {residual:.3e}"),
    }
    if let Some(anchor) = &report.anchor {
        let note = if report.implicit_anchor { " (implicit)" } else { "" };
        println!("anchor: {anchor}{note}");
    }
    for id in &report.removed_constraints {
        println!("removed constraint: {id}");
    }
    if !report.updated_bodies.is_empty() {
        println!("updated: {}", report.updated_bodies.join(", "));
    }
    println!("degrees of freedom: {}", report.degrees_of_freedom.len());
    for dof in &report.degrees_of_freedom {
        println!("  {dof}");
    }
}
