//! xtcompat - legacy packet-filter rule management CLI
//!
//! A thin command-line surface over the repository operations. The
//! classifier transport is the in-memory engine persisted to a state file,
//! so no privileges are required; a kernel-backed transport is an external
//! collaborator supplied by the environment, not this crate.
//!
//! # Usage
//!
//! ```bash
//! xtcompat add INPUT -- -p tcp --dport 22 -j ACCEPT
//! xtcompat list INPUT --numeric --line-numbers
//! xtcompat save --counters > rules.save
//! xtcompat restore rules.save
//! xtcompat -6 flush
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use tracing::debug;
use xtcompat::core::channel::Placement;
use xtcompat::core::expr::Verdict;
use xtcompat::core::format::FormatFlags;
use xtcompat::core::memory::MemoryChannel;
use xtcompat::core::{repo, save};
use xtcompat::{Error, Family, Session, audit, config, utils};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "xtcompat")]
#[command(about = "Legacy packet-filter rules over a declarative classifier", long_about = None)]
#[command(version = build::PKG_VERSION, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Protocol family (ipv4, ipv6, arp, bridge, raw)
    #[arg(long, global = true)]
    family: Option<Family>,

    /// Select the IPv4 family
    #[arg(short = '4', long = "ipv4", global = true, conflicts_with = "family")]
    ipv4: bool,

    /// Select the IPv6 family
    #[arg(short = '6', long = "ipv6", global = true, conflicts_with = "family")]
    ipv6: bool,

    /// Table to operate on
    #[arg(short = 't', long, global = true, default_value = "filter")]
    table: String,

    /// Config file declaring tables and chains
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Ruleset state file backing the in-memory engine
    #[arg(long, global = true, value_name = "PATH")]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List tables known to the engine
    Tables,
    /// List rules of a chain, or of the whole table
    List {
        chain: Option<String>,
        /// Print addresses and interfaces numerically
        #[arg(short = 'n', long)]
        numeric: bool,
        /// Prefix rules with their 1-based position
        #[arg(long)]
        line_numbers: bool,
        /// Show counters and interface columns
        #[arg(short = 'v', long)]
        verbose: bool,
        /// Print exact counter values instead of K/M/G
        #[arg(short = 'x', long)]
        exact: bool,
    },
    /// Print rules in save-script format
    Save {
        /// Include packet/byte counters
        #[arg(short = 'c', long)]
        counters: bool,
        /// Dump every table, not just the selected one
        #[arg(short = 'd', long)]
        dump: bool,
    },
    /// Re-ingest a save script (use `-` for stdin)
    Restore { file: PathBuf },
    /// Append a rule to a chain
    Add {
        chain: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        spec: Vec<String>,
    },
    /// Check whether an equivalent rule exists (never mutates)
    Check {
        chain: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        spec: Vec<String>,
    },
    /// Delete a rule by specification, or by 1-based number with --num
    Delete {
        chain: String,
        #[arg(long)]
        num: Option<usize>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        spec: Vec<String>,
    },
    /// Replace the rule at a 1-based position
    Replace {
        chain: String,
        num: usize,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        spec: Vec<String>,
    },
    /// Delete all rules of a chain, or of the whole table
    Flush { chain: Option<String> },
    /// Create a user chain
    NewChain { chain: String },
    /// Delete a user chain
    DeleteChain { chain: String },
    /// Rename a user chain
    RenameChain { chain: String, newname: String },
    /// Set the policy of a base chain
    Policy { chain: String, policy: String },
}

fn main() -> ExitCode {
    let _ = utils::ensure_dirs();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match handle_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn state_path(cli: &Cli) -> xtcompat::Result<PathBuf> {
    cli.state
        .clone()
        .or_else(|| utils::get_state_dir().map(|dir| dir.join("ruleset.json")))
        .ok_or_else(|| Error::ChannelUnavailable("no state directory available".to_string()))
}

fn commit_and_persist(
    h: &mut Session,
    engine: &MemoryChannel,
    path: &Path,
    table: &str,
) -> xtcompat::Result<()> {
    let messages = h.pending();
    let result = h.commit();
    audit::log_commit(
        Some(table),
        messages,
        result.is_ok(),
        result.as_ref().err().map(ToString::to_string),
    );
    result?;
    engine.persist(path)?;
    Ok(())
}

fn handle_cli(cli: Cli) -> xtcompat::Result<()> {
    let config_path = cli.config.clone().or_else(config::default_config_path);
    let cfg = match &config_path {
        Some(path) => config::load_config(path)?,
        None => config::RulesetConfig::default(),
    };
    let family = if cli.ipv4 {
        Family::Ipv4
    } else if cli.ipv6 {
        Family::Ipv6
    } else {
        cli.family.unwrap_or(cfg.family)
    };

    let path = state_path(&cli)?;
    let channel = MemoryChannel::load(&path)?;
    let engine = channel.clone();
    let mut h = Session::open(family, Box::new(channel));

    if !nix::unistd::geteuid().is_root() {
        debug!("running unprivileged; changes affect only the state file");
    }

    if !cfg.tables.is_empty() {
        config::apply_config(&mut h, &cfg)?;
        h.commit()?;
        engine.persist(&path)?;
    }

    let table = cli.table.as_str();
    match cli.command {
        Commands::Tables => {
            for t in repo::table_list(&mut h)? {
                if t.dormant {
                    println!("{} (dormant)", t.name);
                } else {
                    println!("{}", t.name);
                }
            }
        }
        Commands::List {
            chain,
            numeric,
            line_numbers,
            verbose,
            exact,
        } => {
            let mut flags = FormatFlags::OPTIONS;
            if numeric {
                flags = flags | FormatFlags::NUMERIC;
            }
            if line_numbers {
                flags = flags | FormatFlags::LINENUMBERS;
            }
            if verbose {
                flags = flags | FormatFlags::VIA;
                if !exact {
                    flags = flags | FormatFlags::KILOMEGAGIGA;
                }
            } else {
                flags = flags | FormatFlags::NOCOUNTS;
            }
            print!("{}", repo::rule_list(&mut h, table, chain.as_deref(), flags)?);
        }
        Commands::Save { counters, dump } => {
            let selected = if dump { None } else { Some(table) };
            let script = save::save(&mut h, selected, counters)?;
            let now = chrono::Local::now();
            println!(
                "# Generated by xtcompat-save v{} on {}",
                build::PKG_VERSION,
                now.format("%a %b %e %H:%M:%S %Y")
            );
            print!("{script}");
            println!(
                "# Completed on {}",
                chrono::Local::now().format("%a %b %e %H:%M:%S %Y")
            );
        }
        Commands::Restore { file } => {
            let script = if file.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin())?
            } else {
                std::fs::read_to_string(&file)?
            };
            let result = save::restore(&mut h, &script);
            audit::log_restore(
                &file.display().to_string(),
                result.is_ok(),
                result.as_ref().err().map(ToString::to_string),
            );
            result?;
            engine.persist(&path)?;
        }
        Commands::Add { chain, spec } => {
            let cs = save::parse_rule_spec(&spec, 1)?;
            repo::rule_add(&mut h, table, &chain, &cs, Placement::Append)?;
            commit_and_persist(&mut h, &engine, &path, table)?;
        }
        Commands::Check { chain, spec } => {
            let cs = save::parse_rule_spec(&spec, 1)?;
            if !repo::rule_check(&mut h, table, &chain, &cs)? {
                return Err(Error::NoMatchingRule { chain });
            }
        }
        Commands::Delete { chain, num, spec } => {
            match num {
                Some(num) => repo::rule_delete_num(&mut h, table, &chain, num)?,
                None if !spec.is_empty() => {
                    let cs = save::parse_rule_spec(&spec, 1)?;
                    repo::rule_delete(&mut h, table, &chain, &cs)?;
                }
                None => {
                    return Err(Error::Validation {
                        field: "rule".to_string(),
                        message: "delete needs a specification or --num".to_string(),
                    });
                }
            }
            commit_and_persist(&mut h, &engine, &path, table)?;
        }
        Commands::Replace { chain, num, spec } => {
            let cs = save::parse_rule_spec(&spec, 1)?;
            repo::rule_replace(&mut h, table, &chain, num, &cs)?;
            commit_and_persist(&mut h, &engine, &path, table)?;
        }
        Commands::Flush { chain } => {
            repo::rule_flush(&mut h, table, chain.as_deref())?;
            let result = commit_and_persist(&mut h, &engine, &path, table);
            audit::log_flush(
                table,
                chain.as_deref(),
                result.is_ok(),
                result.as_ref().err().map(ToString::to_string),
            );
            result?;
        }
        Commands::NewChain { chain } => {
            repo::chain_user_add(&mut h, table, &chain)?;
            commit_and_persist(&mut h, &engine, &path, table)?;
        }
        Commands::DeleteChain { chain } => {
            repo::chain_user_del(&mut h, table, &chain)?;
            commit_and_persist(&mut h, &engine, &path, table)?;
        }
        Commands::RenameChain { chain, newname } => {
            repo::chain_user_rename(&mut h, table, &chain, &newname)?;
            commit_and_persist(&mut h, &engine, &path, table)?;
        }
        Commands::Policy { chain, policy } => {
            let verdict = Verdict::from_str(&policy).map_err(|_| Error::Validation {
                field: "policy".to_string(),
                message: format!("unknown policy `{policy}`"),
            })?;
            repo::chain_set(&mut h, table, &chain, verdict, None)?;
            commit_and_persist(&mut h, &engine, &path, table)?;
        }
    }
    Ok(())
}
