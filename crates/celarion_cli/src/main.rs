//! CELARION CLI
//!
//! Runs stream graphs, simulates guilds, replays rule logs and resolves
//! node configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]

use celarion_cache::RegisterCacheStore;
use celarion_core::{DirectiveId, ExitCode, GuildName, Hash, MemberId, NodeId, RuleVersion, Value};
use celarion_graph::{Edge, StreamGraph, StreamNode};
use celarion_guild::{Guild, NodeConfig, SyncConfig};
use celarion_proof::{Bindings, Confidence, ProofChain};
use celarion_rules::{Directive, RuleEdit, RuleLog, RuleSetSnapshot, Vault};
use celarion_runtime::{BranchScope, EngineConfig, StackEngine};
use celarion_sim::{EditOutcome, MemberOutcome, NetworkConditions, Proposal, SimConfig, SimHarness, SimSeed};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "celarion")]
#[command(about = "CELARION - guild-replicated directive engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stream graph from its entry route
    Run {
        /// Path to graph JSON
        #[arg(short, long)]
        graph: PathBuf,
        /// Entry nodes, run in order
        #[arg(short, long, value_delimiter = ',', default_value = "0")]
        entry: Vec<u32>,
        /// Initial bindings as name=value
        #[arg(short, long = "bind", value_parser = parse_binding)]
        bindings: Vec<(String, Value)>,
        /// Iteration ceiling per node
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Simulate concurrent proposals in an in-process guild
    Simulate {
        /// Guild size
        #[arg(short, long, default_value_t = 3)]
        members: usize,
        /// Seed naming the delivery permutation
        #[arg(short, long, default_value_t = 42)]
        seed: u64,
        /// Chance per step, in thousandths, of a random member tick
        #[arg(long, default_value_t = 200)]
        tick_rate: u16,
        /// Chance per delivery, in thousandths, of a duplicate
        #[arg(long, default_value_t = 0)]
        duplicates: u16,
        /// Members cut off the network
        #[arg(long, value_delimiter = ',')]
        cut: Vec<String>,
        /// Settle window in ticks
        #[arg(long, default_value_t = 2)]
        settle_window: u64,
    },
    /// Verify a persisted rule log and print the reconstructed state
    Replay {
        /// Path to the rule log
        #[arg(short, long)]
        log: PathBuf,
        /// Path to the graph JSON the directives reference
        #[arg(short, long)]
        graph: PathBuf,
    },
    /// Print the resolved node configuration
    Init {
        /// Node configuration JSON
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Member id when no configuration file is given
        #[arg(short, long, default_value = "member-0")]
        member: String,
        /// Guilds to attach with this member as sole roster entry
        #[arg(long, value_delimiter = ',')]
        guild: Vec<String>,
        /// Disable parallel rule branches
        #[arg(long)]
        sequential: bool,
    },
}

#[derive(Serialize)]
struct SimulateReport {
    seed: u64,
    steps: u64,
    ticks: u64,
    converged: bool,
    members: Vec<MemberOutcome>,
    edits: Vec<EditOutcome>,
    errors: Vec<String>,
}

#[derive(Serialize)]
struct ReplayReport {
    entries: usize,
    head: RuleVersion,
    tip: Hash,
    fingerprint: Hash,
    state: RuleSetSnapshot,
}

#[tokio::main]
async fn main() -> Result<std::process::ExitCode> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("celarion=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run {
            graph,
            entry,
            bindings,
            max_iterations,
        } => run(&graph, &entry, bindings, max_iterations).await?,
        Commands::Simulate {
            members,
            seed,
            tick_rate,
            duplicates,
            cut,
            settle_window,
        } => simulate(members, seed, tick_rate, duplicates, &cut, settle_window)?,
        Commands::Replay { log, graph } => replay(&log, &graph)?,
        Commands::Init {
            config,
            member,
            guild,
            sequential,
        } => init(config.as_deref(), &member, &guild, sequential)?,
    };
    Ok(std::process::ExitCode::from(code.code() as u8))
}

async fn run(
    path: &Path,
    entry: &[u32],
    bindings: Vec<(String, Value)>,
    max_iterations: Option<u32>,
) -> Result<ExitCode> {
    let graph = load_graph(path)?;
    let mut config = EngineConfig::new();
    if let Some(limit) = max_iterations {
        config = config.with_max_iterations(limit);
    }
    let engine = StackEngine::new(config, Arc::new(RegisterCacheStore::new()));
    let entries: Vec<NodeId> = entry.iter().map(|&n| NodeId::from(n)).collect();
    let initial = bindings
        .into_iter()
        .fold(Bindings::new(), |b, (name, value)| b.with(name, value));

    let mut scope = BranchScope::detached(Vault::new());
    let outcome = engine.run_sequence(&graph, &entries, initial, &mut scope).await;
    scope.release().await;
    match outcome {
        Ok(result) => {
            info!(visited = result.trace.len(), "run completed");
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(ExitCode::Success)
        }
        Err(err) => {
            error!(%err, "run failed");
            eprintln!("run failed: {err}");
            Ok(err.exit_code())
        }
    }
}

fn simulate(
    members: usize,
    seed: u64,
    tick_rate: u16,
    duplicates: u16,
    cut: &[String],
    settle_window: u64,
) -> Result<ExitCode> {
    if members == 0 {
        return Err(eyre!("a guild needs at least one member"));
    }
    let names: Vec<MemberId> = (0..members)
        .map(|i| MemberId::new(format!("m{i}")))
        .collect::<Result<_, _>>()?;
    let guild = names
        .iter()
        .fold(Guild::new(GuildName::new("sim")?), |g, m| g.with_member(m.clone(), 1));
    let mut network = NetworkConditions::new().with_duplicates(duplicates);
    let mut cut_members = Vec::with_capacity(cut.len());
    for name in cut {
        let member = MemberId::new(name.as_str())?;
        network = network.with_cut(member.clone());
        cut_members.push(member);
    }

    let sim_seed = SimSeed::from_literal(seed);
    let config = SimConfig::new(sim_seed.clone(), guild)
        .with_sync(SyncConfig::new().with_settle_window(settle_window))
        .with_network(network)
        .with_tick_rate(tick_rate);
    let mut harness = SimHarness::new(config, demo_graph()?)?;

    let proposals = names
        .iter()
        .map(|member| {
            let score = sim_seed.derive(member.as_str()).seed % 1001;
            let directive = Directive::new(
                DirectiveId::new(format!("rule-{member}"))?,
                ProofChain::new(),
                vec![NodeId::from(0)],
            );
            Ok(Proposal::new(
                member.clone(),
                RuleEdit::Define(directive),
                Confidence::from_thousandths(score as u16),
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    let result = match harness.run(proposals) {
        Ok(result) => result,
        Err(err) => {
            error!(%err, "simulation failed");
            eprintln!("simulation failed: {err}");
            return Ok(err.exit_code());
        }
    };
    let report = SimulateReport {
        seed,
        steps: result.steps,
        ticks: result.ticks,
        converged: result.converged(&cut_members),
        members: result.members.clone(),
        edits: result.edits.clone(),
        errors: result.errors.iter().map(ToString::to_string).collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(result.exit_code())
}

fn replay(log_path: &Path, graph_path: &Path) -> Result<ExitCode> {
    let graph = load_graph(graph_path)?;
    let file = fs::File::open(log_path).wrap_err_with(|| format!("opening {}", log_path.display()))?;
    let log = RuleLog::read_from(std::io::BufReader::new(file))?;
    log.verify()?;
    let rules = log.replay(graph)?;
    let report = ReplayReport {
        entries: log.len(),
        head: log.head(),
        tip: log.tip(),
        fingerprint: rules.fingerprint()?,
        state: rules.snapshot(),
    };
    info!(entries = report.entries, head = %report.head, "log verified");
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::Success)
}

fn init(config: Option<&Path>, member: &str, guilds: &[String], sequential: bool) -> Result<ExitCode> {
    let mut resolved = match config {
        Some(path) => {
            let json = fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
            NodeConfig::from_json(&json)?
        }
        None => NodeConfig::new(MemberId::new(member)?),
    };
    for name in guilds {
        let guild = Guild::new(GuildName::new(name.as_str())?).with_member(resolved.member.clone(), 1);
        resolved = resolved.with_guild(guild);
    }
    if sequential {
        resolved = resolved.with_parallel(false);
    }
    resolved.validate()?;
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(ExitCode::Success)
}

fn load_graph(path: &Path) -> Result<Arc<StreamGraph>> {
    let json = fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    Ok(Arc::new(StreamGraph::from_json(&json)?))
}

/// Two-node graph used by simulated directives
fn demo_graph() -> Result<Arc<StreamGraph>> {
    Ok(Arc::new(StreamGraph::from_parts(
        vec![StreamNode::branch(0), StreamNode::terminal(1)],
        vec![Edge::trigger(0, 1)],
    )?))
}

fn parse_binding(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))?;
    if name.is_empty() {
        return Err(format!("binding name missing in {raw:?}"));
    }
    let value = match value {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        number => Value::Int(
            number
                .parse::<i64>()
                .map_err(|e| format!("binding {name}: {e}"))?,
        ),
    };
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binding() {
        assert_eq!(parse_binding("i=3").unwrap(), ("i".to_string(), Value::Int(3)));
        assert_eq!(parse_binding("armed=true").unwrap(), ("armed".to_string(), Value::Bool(true)));
        assert!(parse_binding("i").is_err());
        assert!(parse_binding("=1").is_err());
        assert!(parse_binding("i=x").is_err());
    }

    #[test]
    fn test_cli_parses_simulate() {
        let cli = Cli::try_parse_from(["celarion", "simulate", "--members", "2", "--cut", "m1"]).unwrap();
        match cli.command {
            Commands::Simulate { members, cut, .. } => {
                assert_eq!(members, 2);
                assert_eq!(cut, vec!["m1".to_string()]);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_demo_graph_is_valid() {
        assert_eq!(demo_graph().unwrap().len(), 2);
    }
}
