//! comb-hunt CLI: pre-registered comb detection in angular power spectra.
//!
//! Modes:
//!   --mode=ingest --spectrum=<file>                 Hash inputs into the manifest
//!   --mode=lock --protocol=<file>                   Lock the analysis protocol
//!   --mode=run --protocol=<file> --spectrum=<file>  Run the stress matrix
//!   --mode=calibrate --protocol=<file> --spectrum=<file>  Null-calibration check
//!
//! Options:
//!   --spectrum=<file>      Plain-text spectrum file (repeatable via commas)
//!   --covariance=<file>    Covariance matrix for the spectrum (optional)
//!   --map=<file> --map-b=<file>  Sky-map pair for the coherence cells
//!   --protocol=<file>      Protocol JSONL log (default: protocol.jsonl)
//!   --manifest=<file>      Manifest JSONL log (default: manifest.jsonl)
//!   --out=<dir>            Output directory for reports (default: results)
//!   --dataset=<name>       Dataset label for the spectra (default: dataset)
//!   --trials=<N>           Override Monte-Carlo trials before locking
//!   --seed=<N>             Override master seed before locking
//!   --periods=64,128       Override target periods before locking
//!   --strict               Refuse reduced-rigor whitening fallbacks
//!   --sequential           Disable the Rayon worker pool
//!
//! Exit status is 0 whenever the pipeline completes, whether the verdict is
//! CANDIDATE or NULL; a null result is a result. Typed failures exit 1.

use std::path::{Path, PathBuf};

use comb_hunt::error::Result;
use comb_hunt::loader;
use comb_hunt::manifest::Manifest;
use comb_hunt::montecarlo::{trial_seed, McEngine};
use comb_hunt::protocol::Protocol;
use comb_hunt::report;
use comb_hunt::spectrum::Units;
use comb_hunt::stress::{self, ChannelInput, DatasetInput, MapPairInput};
use comb_hunt::verdict;

/// CLI configuration parsed from command-line arguments.
struct CliConfig {
    mode: Mode,
    spectra: Vec<PathBuf>,
    covariance: Option<PathBuf>,
    map_a: Option<PathBuf>,
    map_b: Option<PathBuf>,
    protocol_log: PathBuf,
    manifest_log: PathBuf,
    out_dir: PathBuf,
    dataset: String,
    trials: Option<usize>,
    seed: Option<u64>,
    periods: Option<Vec<f64>>,
    strict: bool,
    sequential: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Ingest,
    Lock,
    Run,
    Calibrate,
}

fn parse_args() -> CliConfig {
    let args: Vec<String> = std::env::args().collect();

    let mode = if args.iter().any(|a| a.contains("--mode=ingest")) {
        Mode::Ingest
    } else if args.iter().any(|a| a.contains("--mode=lock")) {
        Mode::Lock
    } else if args.iter().any(|a| a.contains("--mode=calibrate")) {
        Mode::Calibrate
    } else {
        Mode::Run
    };

    let spectra: Vec<PathBuf> = args
        .iter()
        .find(|a| a.starts_with("--spectrum="))
        .map(|a| {
            a.strip_prefix("--spectrum=")
                .unwrap()
                .split(',')
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default();

    let covariance = args
        .iter()
        .find(|a| a.starts_with("--covariance="))
        .map(|a| PathBuf::from(a.strip_prefix("--covariance=").unwrap()));

    let map_a = args
        .iter()
        .find(|a| a.starts_with("--map="))
        .map(|a| PathBuf::from(a.strip_prefix("--map=").unwrap()));

    let map_b = args
        .iter()
        .find(|a| a.starts_with("--map-b="))
        .map(|a| PathBuf::from(a.strip_prefix("--map-b=").unwrap()));

    let protocol_log = args
        .iter()
        .find(|a| a.starts_with("--protocol="))
        .map(|a| PathBuf::from(a.strip_prefix("--protocol=").unwrap()))
        .unwrap_or_else(|| PathBuf::from("protocol.jsonl"));

    let manifest_log = args
        .iter()
        .find(|a| a.starts_with("--manifest="))
        .map(|a| PathBuf::from(a.strip_prefix("--manifest=").unwrap()))
        .unwrap_or_else(|| PathBuf::from("manifest.jsonl"));

    let out_dir = args
        .iter()
        .find(|a| a.starts_with("--out="))
        .map(|a| PathBuf::from(a.strip_prefix("--out=").unwrap()))
        .unwrap_or_else(|| PathBuf::from("results"));

    let dataset = args
        .iter()
        .find(|a| a.starts_with("--dataset="))
        .map(|a| a.strip_prefix("--dataset=").unwrap().to_string())
        .unwrap_or_else(|| "dataset".to_string());

    let trials = args
        .iter()
        .find(|a| a.starts_with("--trials="))
        .and_then(|a| a.strip_prefix("--trials=")?.parse::<usize>().ok());

    let seed = args
        .iter()
        .find(|a| a.starts_with("--seed="))
        .and_then(|a| a.strip_prefix("--seed=")?.parse::<u64>().ok());

    let periods: Option<Vec<f64>> = args
        .iter()
        .find(|a| a.starts_with("--periods="))
        .map(|a| {
            a.strip_prefix("--periods=")
                .unwrap()
                .split(',')
                .filter_map(|s| s.trim().parse::<f64>().ok())
                .collect()
        });

    let strict = args.iter().any(|a| a == "--strict");
    let sequential = args.iter().any(|a| a == "--sequential");

    CliConfig {
        mode,
        spectra,
        covariance,
        map_a,
        map_b,
        protocol_log,
        manifest_log,
        out_dir,
        dataset,
        trials,
        seed,
        periods,
        strict,
        sequential,
    }
}

fn main() {
    env_logger::init();
    let config = parse_args();

    let outcome = match config.mode {
        Mode::Ingest => run_ingest_mode(&config),
        Mode::Lock => run_lock_mode(&config),
        Mode::Run => run_run_mode(&config),
        Mode::Calibrate => run_calibrate_mode(&config),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Hash every named input into the manifest log without analyzing it.
fn run_ingest_mode(config: &CliConfig) -> Result<()> {
    if config.spectra.is_empty() {
        eprintln!("ingest mode needs at least one --spectrum=<file>");
        std::process::exit(1);
    }
    let mut manifest = Manifest::new();
    for path in &config.spectra {
        let entry = manifest.ingest(path, None)?;
        println!("{}  {} ({} bytes)", entry.sha256, entry.path.display(), entry.bytes);
    }
    if let Some(cov) = &config.covariance {
        let entry = manifest.ingest(cov, None)?;
        println!("{}  {} ({} bytes)", entry.sha256, entry.path.display(), entry.bytes);
    }
    manifest.append_to(&config.manifest_log)?;
    println!("manifest appended to {}", config.manifest_log.display());
    Ok(())
}

/// Build (or amend) a protocol from the CLI overrides, lock it, and append
/// the locked version to the protocol log.
fn run_lock_mode(config: &CliConfig) -> Result<()> {
    let mut builder = match Protocol::read_latest(&config.protocol_log) {
        Ok(existing) if existing.is_locked() => {
            println!(
                "protocol {} already locked; amending to version {}",
                existing.id(),
                existing.version() + 1
            );
            existing.amend()
        }
        Ok(existing) => existing.amend(),
        Err(_) => Protocol::builder("comb-hunt"),
    };
    if let Some(trials) = config.trials {
        builder = builder.trials(trials);
    }
    if let Some(seed) = config.seed {
        builder = builder.seed(seed);
    }
    if let Some(periods) = &config.periods {
        builder = builder.target_periods(periods.clone());
    }
    builder = builder.strict(config.strict);

    let mut protocol = builder.build()?;
    protocol.lock()?;
    protocol.append_to(&config.protocol_log)?;
    println!("locked protocol {} at {}", protocol.id(), config.protocol_log.display());
    println!("  periods: {:?}", protocol.target_periods());
    println!("  ranges:  {:?}", protocol.ell_ranges());
    println!("  trials:  {}  seed: {}", protocol.trials(), protocol.seed());
    Ok(())
}

fn load_dataset(config: &CliConfig, manifest: &mut Manifest) -> Result<DatasetInput> {
    let mut channels = Vec::new();
    for (i, path) in config.spectra.iter().enumerate() {
        let (spectrum, entry) =
            loader::load_spectrum(path, Units::MicroKelvinSquared, None, manifest)?;
        let name = channel_name(path, i);
        println!("loaded {}: {} multipoles, sha256 {}", name, spectrum.len(), &entry.sha256[..16]);
        let covariance = match &config.covariance {
            Some(cov_path) => {
                let (cov, _) =
                    loader::load_covariance(cov_path, spectrum.ells(), None, manifest)?;
                Some(cov)
            }
            None => None,
        };
        channels.push(ChannelInput {
            name,
            spectrum,
            covariance,
        });
    }
    Ok(DatasetInput {
        name: config.dataset.clone(),
        channels,
    })
}

/// Load the coherence map pair when both map flags are given.
fn load_map_pair(config: &CliConfig, manifest: &mut Manifest) -> Result<Vec<MapPairInput>> {
    let (path_a, path_b) = match (&config.map_a, &config.map_b) {
        (Some(a), Some(b)) => (a, b),
        (None, None) => return Ok(Vec::new()),
        _ => {
            eprintln!("coherence cells need both --map=<file> and --map-b=<file>");
            std::process::exit(1);
        }
    };
    let (channel_a, entry_a) = loader::load_map(path_a, None, manifest)?;
    let (channel_b, entry_b) = loader::load_map(path_b, None, manifest)?;
    Ok(vec![MapPairInput {
        name: format!("{}x{}", channel_name(path_a, 0), channel_name(path_b, 1)),
        channel_a,
        channel_b,
        digests: vec![entry_a.sha256, entry_b.sha256],
    }])
}

fn channel_name(path: &Path, index: usize) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("channel{index}"))
}

/// Run the full pre-registered stress matrix against the loaded data and
/// write CSV + JSON reports.
fn run_run_mode(config: &CliConfig) -> Result<()> {
    if config.spectra.is_empty() && config.map_a.is_none() {
        eprintln!("run mode needs --spectrum=<file> or a --map=/--map-b= pair");
        std::process::exit(1);
    }
    let protocol = Protocol::read_latest(&config.protocol_log)?;
    println!("protocol {} (locked: {})", protocol.id(), protocol.is_locked());

    let mut manifest = Manifest::new();
    let datasets: Vec<DatasetInput> = if config.spectra.is_empty() {
        Vec::new()
    } else {
        vec![load_dataset(config, &mut manifest)?]
    };
    let map_pairs = load_map_pair(config, &mut manifest)?;
    manifest.append_to(&config.manifest_log)?;

    let outcomes = stress::run_matrix(
        &protocol,
        &datasets,
        &map_pairs,
        !config.sequential,
        None,
    )?;
    let combined = verdict::combine(&protocol, outcomes)?;

    std::fs::create_dir_all(&config.out_dir)?;
    let csv_path = config.out_dir.join("cells.csv");
    let json_path = config.out_dir.join("verdict.json");
    report::write_csv(&csv_path, &combined)?;
    report::write_json(&json_path, &combined)?;

    println!();
    print!("{}", report::render_summary(&combined));
    println!();
    println!("reports: {} and {}", csv_path.display(), json_path.display());
    Ok(())
}

/// Null-calibration check: the detector + null pairing applied to its own
/// null realizations should produce roughly uniform p-values.
fn run_calibrate_mode(config: &CliConfig) -> Result<()> {
    if config.spectra.is_empty() {
        eprintln!("calibrate mode needs at least one --spectrum=<file>");
        std::process::exit(1);
    }
    let protocol = Protocol::read_latest(&config.protocol_log)?;
    let mut manifest = Manifest::new();
    let dataset = load_dataset(config, &mut manifest)?;

    let cells = stress::build_plan(&protocol, std::slice::from_ref(&dataset), &[]);
    println!("calibrating {} cells, {} trials each", cells.len(), protocol.trials());

    let repetitions = 200;
    for (cell_index, cell) in cells.iter().enumerate() {
        let engine = McEngine {
            trials: protocol.trials(),
            seed: trial_seed(protocol.seed(), cell_index as u64),
            parallel: !config.sequential,
            cancel: None,
        };
        let p_values =
            stress::calibrate_cell(&engine, &protocol, &dataset, cell, repetitions)?;
        let below_half = p_values.iter().filter(|&&p| p <= 0.5).count();
        let mean: f64 = p_values.iter().sum::<f64>() / p_values.len() as f64;
        println!(
            "  {:<50} mean p={:.3}, {}/{} below 0.5",
            cell.name, mean, below_half, repetitions
        );
    }
    Ok(())
}
