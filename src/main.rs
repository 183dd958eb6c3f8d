//! sgfw - security-group firewall compiler
//!
//! Command-line front end for the library: compiles one entity's rules for
//! inspection, or prepares a set of entities in one batch and commits them
//! to nftables (or, with `--dry-run`, to memory).
//!
//! # Usage
//!
//! ```bash
//! sgfw compile --policy policy.json --topology vm-1.json --entity vm-1
//! sgfw compile --policy policy.json --topology vm-1.json --entity vm-1 --format json
//! sgfw apply --policy policy.json --entities entities.json --dry-run
//! sgfw apply --policy policy.json --entities entities.json
//! sgfw config
//! sgfw config --set enable_ipv6=false --set driver=noop
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use sgfw::config::{FirewallConfig, default_config_path, load_config, save_config};
use sgfw::core::compiler::RuleCompiler;
use sgfw::core::driver::load_driver;
use sgfw::core::model::{EntityId, IpVersion};
use sgfw::core::nft_json::{NftablesSink, render_text};
use sgfw::core::policy::{InMemoryPolicyStore, PolicyStore};
use sgfw::core::sink::{FilterSink, MemorySink};
use sgfw::core::topology::TopologyInput;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "sgfw")]
#[command(about = "Compiles security-group policy into per-instance nftables chains", long_about = None)]
struct Cli {
    /// Configuration file (default: XDG config dir)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs to <state dir>/sgfw.log instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Nft,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the compiled rule lists of one entity
    Compile {
        /// Policy snapshot (JSON)
        #[arg(long)]
        policy: PathBuf,
        /// Entity topology, normalized or interface model (JSON)
        #[arg(long)]
        topology: PathBuf,
        #[arg(long)]
        entity: String,
        #[arg(short, long, value_enum, default_value = "nft")]
        format: Format,
    },
    /// Prepare every entity of a file in one batch and commit
    Apply {
        /// Policy snapshot (JSON)
        #[arg(long)]
        policy: PathBuf,
        /// Map of entity id to topology (JSON)
        #[arg(long)]
        entities: PathBuf,
        /// Commit to memory and print the resulting tables
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the effective configuration, or change and save it
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
        /// Change one setting and save (repeatable)
        #[arg(long, value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
}

fn init_logging(log_path: Option<PathBuf>, verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    if let Some(log_path) = log_path {
        match std::fs::File::create(&log_path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_max_level(level)
                    .with_ansi(false)
                    .with_writer(file)
                    .init();
                return;
            }
            Err(e) => eprintln!(
                "Warning: cannot open {} ({e}), logging to stderr",
                log_path.display()
            ),
        }
    }
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_path = if cli.log_file {
        sgfw::utils::log_file_path()
            .inspect_err(|e| eprintln!("Warning: cannot create state directory ({e}), logging to stderr"))
            .ok()
    } else {
        None
    };
    init_logging(log_path, cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn effective_config(path: Option<PathBuf>) -> sgfw::Result<FirewallConfig> {
    match path {
        Some(path) => load_config(&path).await,
        None => Ok(FirewallConfig::default()),
    }
}

async fn load_policy(path: &Path) -> sgfw::Result<InMemoryPolicyStore> {
    let json = tokio::fs::read_to_string(path).await?;
    InMemoryPolicyStore::from_json(&json)
}

async fn handle_cli(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = cli.config.or_else(default_config_path);
    let mut config = effective_config(config_path.clone()).await?;

    match cli.command {
        Commands::Compile {
            policy,
            topology,
            entity,
            format,
        } => {
            let store = load_policy(&policy).await?;
            let topology: TopologyInput =
                serde_json::from_str(&tokio::fs::read_to_string(&topology).await?)?;
            let entity = EntityId::from(entity);

            let rules = RuleCompiler::new(&config).compile(&entity, &topology.normalize(), &store)?;
            let versions = IpVersion::active(config.enable_ipv6);

            match format {
                Format::Nft => {
                    for &version in versions {
                        println!("# {version}");
                        for rule in rules.for_version(version) {
                            println!("{rule}");
                        }
                    }
                }
                Format::Json => {
                    let out: BTreeMap<String, Vec<Vec<serde_json::Value>>> = versions
                        .iter()
                        .map(|&version| {
                            let exprs = rules
                                .for_version(version)
                                .iter()
                                .map(sgfw::core::fragment::Fragment::to_nft_exprs)
                                .collect();
                            (version.to_string(), exprs)
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::Apply {
            policy,
            entities,
            dry_run,
        } => {
            let store: Arc<dyn PolicyStore> = Arc::new(load_policy(&policy).await?);
            let entities: BTreeMap<EntityId, TopologyInput> =
                serde_json::from_str(&tokio::fs::read_to_string(&entities).await?)?;

            let memory = MemorySink::new();
            let journal = memory.journal();
            let sink: Box<dyn FilterSink> = if dry_run {
                Box::new(memory)
            } else {
                if !nix::unistd::getuid().is_root() {
                    println!("Note: Not running as root. Will use run0/sudo for nft.");
                }
                let mut sink = NftablesSink::new(&config.table_name, config.verify_before_apply);
                match sgfw::utils::ensure_dirs().and_then(|()| sgfw::audit::AuditLog::new()) {
                    Ok(audit) => sink = sink.with_audit(audit),
                    Err(e) => eprintln!("Warning: audit log disabled ({e})"),
                }
                Box::new(sink)
            };

            let driver = load_driver(&config, store, sink)?;
            driver.begin_batch()?;
            for (entity, topology) in entities {
                driver.prepare(&entity, topology)?;
            }
            driver.end_batch()?;

            if dry_run {
                match journal.last() {
                    Some(tables) => print!("{}", render_text(&tables, &config.table_name)),
                    None => println!("# nothing committed"),
                }
            } else {
                println!("✓ Rules applied to kernel.");
            }
        }
        Commands::Config { init, set } => {
            for assignment in &set {
                config.set(assignment)?;
            }
            if init || !set.is_empty() {
                let path = config_path.ok_or("no config directory; pass --config")?;
                save_config(&config, &path).await?;
                tracing::info!("Saved configuration to {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
