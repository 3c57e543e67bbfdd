use callforge_core::config::CallforgeConfig;
use callforge_core::corpus::{Corpus, ProgCorpus};
use callforge_core::minimization::minimize;
use callforge_core::mutation::ProgMutator;
use callforge_core::prio::{ChoiceTable, calculate_priorities, enabled_by_name};
use callforge_core::{deserialize, generate, get_target, supported_targets};

use clap::{Parser, Subcommand};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long = "config", value_parser)]
    config_file: Option<PathBuf>,
    /// Overrides `generation.seed`.
    #[clap(short, long)]
    seed: Option<u64>,
    #[clap(long)]
    os: Option<String>,
    #[clap(long)]
    arch: Option<String>,
    #[clap(short, long)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print freshly generated programs.
    Generate {
        #[clap(short, long, default_value_t = 1)]
        count: usize,
        #[clap(short, long)]
        length: Option<usize>,
    },
    /// Print mutants of the program in FILE.
    Mutate {
        file: PathBuf,
        #[clap(short, long)]
        rounds: Option<u64>,
    },
    /// Shrink the program in FILE while it still contains every --keep call.
    Minimize {
        file: PathBuf,
        #[clap(long)]
        call: Option<usize>,
        #[clap(long, num_args = 1..)]
        keep: Vec<String>,
    },
    /// Decode, validate and print the program in FILE in canonical form.
    Check { file: PathBuf },
    /// List the built-in targets.
    Targets,
}

fn load_config(cli: &Cli) -> Result<CallforgeConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            log::info!("Loading configuration from specified path: {config_path:?}");
            CallforgeConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("callforge.toml");
            if default_config_path.exists() {
                log::info!("No config file specified, loading default: {default_config_path:?}");
                CallforgeConfig::load_from_file(&default_config_path)?
            } else {
                log::debug!("No config file found, using built-in defaults");
                CallforgeConfig::default()
            }
        }
    };
    if let Some(seed) = cli.seed {
        config.generation.seed = seed;
    }
    if let Some(os) = &cli.os {
        config.target.os = os.clone();
    }
    if let Some(arch) = &cli.arch {
        config.target.arch = arch.clone();
    }
    Ok(config)
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        log::Level::Debug
    } else {
        log::Level::Info
    };
    simple_logger::init_with_level(level)?;

    if let Command::Targets = cli.command {
        for (os, arch) in supported_targets() {
            println!("{os}/{arch}");
        }
        return Ok(());
    }

    let config = load_config(&cli)?;
    log::debug!("Effective configuration: {config:#?}");

    let target = get_target(&config.target.os, &config.target.arch)?;
    let mut corpus = ProgCorpus::new(target.clone());
    if let Some(seed_paths) = config
        .corpus
        .as_ref()
        .and_then(|c| c.initial_seed_paths.as_ref())
    {
        let loaded = corpus.load_initial_seeds(&target, seed_paths)?;
        log::info!("Loaded {loaded} seed programs");
    }

    let prios = calculate_priorities(&target, corpus.programs());
    let enabled = config
        .target
        .enabled_calls
        .as_deref()
        .map(|names| enabled_by_name(&target, names))
        .transpose()?;
    let ct = ChoiceTable::build(&target, Some(prios.as_slice()), enabled.as_ref())?;
    let mut rng = ChaCha8Rng::seed_from_u64(config.generation.seed);

    match cli.command {
        Command::Generate { count, length } => {
            let length = length.unwrap_or(config.generation.program_length);
            for i in 0..count {
                let prog = generate(&target, &mut rng, length, Some(&ct));
                if i > 0 {
                    println!();
                }
                print!("{}", prog.serialize());
            }
        }
        Command::Mutate { file, rounds } => {
            let text = std::fs::read_to_string(&file)
                .map_err(|e| anyhow::anyhow!("Failed to read program file {:?}: {}", file, e))?;
            let prog = deserialize(&target, &text)?;
            let rounds = rounds.unwrap_or(config.mutation.rounds);
            let mutator = ProgMutator::new(config.mutation.weights);
            let length = config.generation.program_length.max(prog.len());
            let start_time = Instant::now();
            let mut changed = 0;
            for round in 0..rounds {
                let mut mutant = prog.clone();
                if mutator.mutate(&mut mutant, &mut rng, length, Some(&ct), corpus.programs()) {
                    changed += 1;
                }
                if round > 0 {
                    println!();
                }
                print!("{}", mutant.serialize());
            }
            log::info!(
                "{changed} of {rounds} rounds changed the program in {:.2?}",
                start_time.elapsed()
            );
        }
        Command::Minimize { file, call, keep } => {
            let text = std::fs::read_to_string(&file)
                .map_err(|e| anyhow::anyhow!("Failed to read program file {:?}: {}", file, e))?;
            let prog = deserialize(&target, &text)?;
            let mut oracle_calls = 0u64;
            let (min, idx) = minimize(
                &prog,
                call,
                |p, _| {
                    oracle_calls += 1;
                    keep.iter()
                        .all(|name| p.calls.iter().any(|c| c.meta.name == *name))
                },
                config.minimization.allow_partial_removal,
            );
            log::info!(
                "Minimized {} -> {} calls with {oracle_calls} predicate calls",
                prog.len(),
                min.len()
            );
            print!("{}", min.serialize());
            match idx {
                Some(i) => println!("# tracked call: {i}"),
                None => println!("# tracked call: none"),
            }
        }
        Command::Check { file } => {
            let text = std::fs::read_to_string(&file)
                .map_err(|e| anyhow::anyhow!("Failed to read program file {:?}: {}", file, e))?;
            let prog = deserialize(&target, &text)?;
            print!("{}", prog.serialize());
            log::info!("{} calls: {}", prog.len(), prog.summary());
        }
        Command::Targets => {}
    }

    Ok(())
}
