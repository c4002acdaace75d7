//! Thin operator CLI over the glyphos library.
//!
//! Exit codes: 0 on success, 1 on validation failure, 2 on internal error.
//! The `daemon` subcommand is the entry point sub-agent spawns use.

use std::collections::VecDeque;
use std::process::ExitCode;
use std::sync::Arc;

use glyphos::{
    consolidate, embed_glyphs, semantic_search, topic_index_build, Actor, AgentRuntime,
    AnthropicProvider, Caller, Config, Error, Firewall, Glyph, GlyphQuery, GlyphStore, GlyphType,
    HashEmbedder, Importance, ModelConfig, OllamaProvider, Orchestrator, ProcessLauncher,
    RouteTier, RouterConfig, RunStatus, RuntimeConfig, SemanticParams, TaskRegistry, TaskStatus,
    TieredRouter,
};

fn main() -> ExitCode {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        eprintln!("{}", USAGE);
        return ExitCode::from(1);
    };

    match dispatch(&command, args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Validation(msg)) => {
            eprintln!("error: {}", msg);
            ExitCode::from(1)
        }
        Err(other) => {
            eprintln!("error: {}", other);
            ExitCode::from(2)
        }
    }
}

const USAGE: &str = "usage: glyphos <command> [args]
  init | migrate | sync | status | health
  write <type> <text> [key=value ...]
  query [key=value ...] [--limit N]
  render [key=value ...] [--limit N]
  recent [<N><h|d|w|m>]
  embed [--force] [--dry-run]
  semantic <query text> [--limit N]
  topic-index [--dry-run]
  consolidate [--dry-run]
  prune [--horizon-days N] [--dry-run]
  task add <task-id> <text> [key=value ...]
  task goal <task-id> <text> [key=value ...]
  task list | task get <task-id> | task update <task-id> <status>
  task done <task-id> | task block <task-id>
  log attempt <task-id> <text> | log result <task-id> success|failure <text>
  log lesson <task-id> <text> | log history <task-id>
  approve <pending-id> | reject <pending-id>
  orchestrate <objective> | daemon --objective <text> [--max-iterations N]";

fn dispatch(command: &str, mut args: VecDeque<String>) -> Result<(), Error> {
    let config = Config::from_env();

    match command {
        "init" => {
            GlyphStore::init(&config.memory_db, &config.anchors_file)?;
            println!("initialized store at {}", config.memory_db.display());
            Ok(())
        }
        "migrate" => {
            let store = open_store(&config)?;
            drop(store); // open() already ran the additive migration
            println!("migration complete");
            Ok(())
        }
        "sync" => {
            let store = open_store(&config)?;
            let report = store.sync(&config.anchors_file)?;
            println!(
                "replayed {} deduplicated {} of {} lines",
                report.replayed, report.deduplicated, report.total_lines
            );
            Ok(())
        }
        "status" | "health" => {
            let store = open_store(&config)?;
            let status = store.status()?;
            println!("glyphs: {} ({} active)", status.total_glyphs, status.active_glyphs);
            println!(
                "embedded: {} ({:.0}% coverage)",
                status.embedded_count,
                status.embedding_coverage * 100.0
            );
            println!("sync lag: {} lines", status.sync_lag);
            println!(
                "freshness: {} <1h, {} <24h, {} <7d",
                status.freshness.under_1h, status.freshness.under_24h, status.freshness.under_7d
            );
            for (topic, count) in &status.top_topics {
                println!("topic {}: {}", topic, count);
            }
            println!("health: {}", status.health);
            Ok(())
        }
        "write" => {
            let glyph_type: GlyphType = args
                .pop_front()
                .ok_or_else(|| Error::validation("write requires a type"))?
                .parse()?;
            let text = args
                .pop_front()
                .ok_or_else(|| Error::validation("write requires text"))?;
            let mut glyph = Glyph::new(glyph_type, text).with_source("cli");
            for pair in args {
                let (key, value) = split_pair(&pair)?;
                match key {
                    "topic" => glyph.topic = Some(value.to_string()),
                    "choice" => glyph.choice = Some(value.to_string()),
                    "rationale" => glyph.rationale = Some(value.to_string()),
                    "importance" => glyph.importance = Some(value.parse()?),
                    "project" => glyph.project = Some(value.to_string()),
                    "due" => glyph.due = Some(value.to_string()),
                    "scope" => glyph.scope = value.parse()?,
                    "visibility" => glyph.visibility = value.parse()?,
                    "chat_id" => glyph.chat_id = Some(value.to_string()),
                    "role" => glyph.agent_role = Some(value.to_string()),
                    "task_id" => glyph.task_id = Some(value.to_string()),
                    other => {
                        return Err(Error::validation(format!("unknown write field '{}'", other)))
                    }
                }
            }
            let store = open_store(&config)?;
            let id = store.append(&glyph)?;
            println!("wrote glyph {}", id);
            Ok(())
        }
        "query" | "render" => {
            let (query, _) = parse_query(args)?;
            let store = open_store(&config)?;
            if command == "query" {
                for glyph in store.query(&query, &Caller::operator())? {
                    println!(
                        "{}\t{}\t{}\t{}",
                        glyph.id,
                        glyph.glyph_type.external(),
                        glyph.topic.as_deref().unwrap_or("-"),
                        glyph.text
                    );
                }
            } else {
                for line in store.render(&query, &Caller::operator())? {
                    println!("{}", line);
                }
            }
            Ok(())
        }
        "recent" => {
            let window = args.pop_front().unwrap_or_else(|| "24h".to_string());
            let store = open_store(&config)?;
            let query = GlyphQuery::new().recent(&window)?.limit(50);
            for line in store.render(&query, &Caller::operator())? {
                println!("{}", line);
            }
            Ok(())
        }
        "embed" => {
            let force = take_flag(&mut args, "--force");
            let dry_run = take_flag(&mut args, "--dry-run");
            let store = open_store(&config)?;
            let embedder = HashEmbedder::default();
            let report = block_on(embed_glyphs(&store, &embedder, None, force, dry_run))?;
            println!(
                "embedded {} skipped {} failed {}",
                report.embedded, report.skipped, report.failed
            );
            Ok(())
        }
        "semantic" => {
            let limit = take_value(&mut args, "--limit")
                .map(|v| v.parse().unwrap_or(10))
                .unwrap_or(10);
            let text = args.into_iter().collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                return Err(Error::validation("semantic requires query text"));
            }
            let store = open_store(&config)?;
            let embedder = HashEmbedder::default();
            let results = block_on(semantic_search(
                &store,
                &embedder,
                &text,
                &GlyphQuery::new(),
                &Caller::operator(),
                &SemanticParams::default(),
                limit,
            ))?;
            for hit in results {
                println!("{:.3}\t{}\t{}", hit.score, hit.glyph.id, hit.glyph.text);
            }
            Ok(())
        }
        "topic-index" => {
            let dry_run = take_flag(&mut args, "--dry-run");
            let store = open_store(&config)?;
            let report = topic_index_build(&store, dry_run)?;
            println!(
                "indexed {} topics covering {} glyphs",
                report.topics_indexed, report.glyphs_covered
            );
            Ok(())
        }
        "consolidate" => {
            let dry_run = take_flag(&mut args, "--dry-run");
            let store = open_store(&config)?;
            let report = block_on(consolidate(&store, None, None, dry_run))?;
            println!(
                "{} clusters, {} superseded, {} created",
                report.clusters,
                report.superseded,
                report.created.len()
            );
            Ok(())
        }
        "prune" => {
            let horizon = take_value(&mut args, "--horizon-days")
                .map(|v| v.parse().unwrap_or(30))
                .unwrap_or(30);
            let dry_run = take_flag(&mut args, "--dry-run");
            let store = open_store(&config)?;
            let ids = store.prune(horizon, dry_run)?;
            println!(
                "{} {} glyphs",
                if dry_run { "would prune" } else { "pruned" },
                ids.len()
            );
            Ok(())
        }
        "task" => task_command(&config, args),
        "log" => log_command(&config, args),
        "approve" | "reject" => {
            let pending_id: i64 = args
                .pop_front()
                .ok_or_else(|| Error::validation("requires a pending id"))?
                .parse()
                .map_err(|_| Error::validation("pending id must be an integer"))?;
            let store = Arc::new(open_store(&config)?);
            let firewall = Firewall::new(store, std::env::current_dir().unwrap_or_default());
            if command == "approve" {
                let outcome = firewall.approve(pending_id, "operator")?;
                println!("approved; replay decision: {}", outcome.decision);
            } else {
                firewall.reject(pending_id, "operator")?;
                println!("rejected");
            }
            Ok(())
        }
        "orchestrate" => {
            let objective = args.into_iter().collect::<Vec<_>>().join(" ");
            if objective.is_empty() {
                return Err(Error::validation("orchestrate requires an objective"));
            }
            let store = Arc::new(open_store(&config)?);
            let launcher = Arc::new(ProcessLauncher::resolve("glyphos")?);
            let orchestrator = Orchestrator::new(store, launcher);
            let outcome = block_on(orchestrator.run(&objective, None))?;
            println!(
                "orch {} finished {} after {} rounds",
                outcome.orch_id, outcome.final_phase, outcome.rounds
            );
            Ok(())
        }
        "daemon" => daemon_command(&config, args),
        other => Err(Error::validation(format!("unknown command '{}'", other))),
    }
}

fn task_command(config: &Config, mut args: VecDeque<String>) -> Result<(), Error> {
    let sub = args
        .pop_front()
        .ok_or_else(|| Error::validation("task requires a subcommand"))?;
    let store = Arc::new(open_store(config)?);
    let registry =
        TaskRegistry::new(store).with_claim_ttl_minutes(config.claim_ttl_minutes);

    match sub.as_str() {
        "add" | "goal" => {
            let task_id = args
                .pop_front()
                .ok_or_else(|| Error::validation("task add requires a task id"))?;
            let text = args
                .pop_front()
                .ok_or_else(|| Error::validation("task add requires text"))?;
            let mut topic = None;
            let mut importance: Option<Importance> = None;
            for pair in args {
                let (key, value) = split_pair(&pair)?;
                match key {
                    "topic" => topic = Some(value.to_string()),
                    "importance" => importance = Some(value.parse()?),
                    other => {
                        return Err(Error::validation(format!("unknown task field '{}'", other)))
                    }
                }
            }
            let glyph_type = if sub == "goal" { GlyphType::Goal } else { GlyphType::Todo };
            let id = registry.add_task(&task_id, glyph_type, topic.as_deref(), &text, importance)?;
            println!("created task {} (glyph {})", task_id, id);
            Ok(())
        }
        "list" => {
            for task in registry.list(None, None, 50)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    task.task_id,
                    task.status,
                    task.importance.map(|i| i.to_string()).unwrap_or_else(|| "-".into()),
                    task.text
                );
            }
            Ok(())
        }
        "get" => {
            let task_id = args
                .pop_front()
                .ok_or_else(|| Error::validation("task get requires a task id"))?;
            match registry.get(&task_id)? {
                Some(task) => {
                    println!("{} {} {}", task.task_id, task.status, task.text);
                    if let Some(owner) = task.owner {
                        println!("owner: {}", owner);
                    }
                    Ok(())
                }
                None => Err(Error::validation(format!("no task '{}'", task_id))),
            }
        }
        "update" => {
            let task_id = args
                .pop_front()
                .ok_or_else(|| Error::validation("task update requires a task id"))?;
            let status: TaskStatus = args
                .pop_front()
                .ok_or_else(|| Error::validation("task update requires a status"))?
                .parse()?;
            registry.update_status(&task_id, status, Actor::Elevated)?;
            println!("task {} -> {}", task_id, status);
            Ok(())
        }
        "done" => {
            let task_id = args
                .pop_front()
                .ok_or_else(|| Error::validation("task done requires a task id"))?;
            registry.update_status(&task_id, TaskStatus::Done, Actor::Elevated)?;
            println!("task {} -> DONE", task_id);
            Ok(())
        }
        "block" => {
            let task_id = args
                .pop_front()
                .ok_or_else(|| Error::validation("task block requires a task id"))?;
            registry.update_status(&task_id, TaskStatus::Blocked, Actor::Elevated)?;
            println!("task {} -> BLOCKED", task_id);
            Ok(())
        }
        other => Err(Error::validation(format!("unknown task subcommand '{}'", other))),
    }
}

fn log_command(config: &Config, mut args: VecDeque<String>) -> Result<(), Error> {
    let sub = args
        .pop_front()
        .ok_or_else(|| Error::validation("log requires a subcommand"))?;
    let store = Arc::new(open_store(config)?);
    let registry = TaskRegistry::new(store);

    let task_id = args
        .pop_front()
        .ok_or_else(|| Error::validation("log requires a task id"))?;

    match sub.as_str() {
        "attempt" => {
            let text = args.into_iter().collect::<Vec<_>>().join(" ");
            registry.log_attempt(&task_id, &text, Some("cli"))?;
            Ok(())
        }
        "result" => {
            let verdict = args
                .pop_front()
                .ok_or_else(|| Error::validation("log result requires success|failure"))?;
            let success = match verdict.as_str() {
                "success" => true,
                "failure" => false,
                other => {
                    return Err(Error::validation(format!(
                        "result must be success or failure, not '{}'",
                        other
                    )))
                }
            };
            let text = args.into_iter().collect::<Vec<_>>().join(" ");
            registry.log_result(&task_id, success, &text, None, Some("cli"))?;
            Ok(())
        }
        "lesson" => {
            let text = args.into_iter().collect::<Vec<_>>().join(" ");
            registry.log_lesson(Some(&task_id), None, &text, Some("cli"))?;
            Ok(())
        }
        "history" => {
            for glyph in registry.history(&task_id)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    glyph.timestamp.to_rfc3339(),
                    glyph.glyph_type.external(),
                    glyph.choice.as_deref().unwrap_or("-"),
                    glyph.text
                );
            }
            Ok(())
        }
        other => Err(Error::validation(format!("unknown log subcommand '{}'", other))),
    }
}

fn daemon_command(config: &Config, mut args: VecDeque<String>) -> Result<(), Error> {
    let objective = take_value(&mut args, "--objective")
        .ok_or_else(|| Error::validation("daemon requires --objective"))?;
    let max_iterations = take_value(&mut args, "--max-iterations")
        .map(|v| v.parse().unwrap_or(10))
        .unwrap_or(10);
    let planner = take_flag(&mut args, "--planner");

    let store = Arc::new(open_store(config)?);
    let registry = Arc::new(
        TaskRegistry::new(store.clone()).with_claim_ttl_minutes(config.claim_ttl_minutes),
    );
    let sandbox_root = std::env::current_dir().unwrap_or_default();
    let firewall = Arc::new(Firewall::new(store.clone(), sandbox_root));
    let router = Arc::new(build_router(config)?);

    let mut runtime_config = if planner {
        RuntimeConfig::planner()
    } else {
        RuntimeConfig::default()
    };
    runtime_config.max_iterations = max_iterations;
    runtime_config.chat_id = config.chat_id.clone();
    runtime_config.role = config.todo_role.clone();

    let runtime = AgentRuntime::new(store, registry, firewall, router, runtime_config)
        .with_launcher(Arc::new(ProcessLauncher::resolve("glyphos")?));

    let report = block_on(runtime.run_objective(&objective, None, None))?;
    println!("{}", report.summary);
    match report.status {
        RunStatus::Done => Ok(()),
        other => Err(Error::Internal(format!("daemon ended {}", other))),
    }
}

/// Assemble the three-tier router from configuration. Tiers without a
/// reachable provider are simply left empty; the fallback chain skips them.
fn build_router(config: &Config) -> Result<TieredRouter, Error> {
    let mut router = TieredRouter::new(RouterConfig::default(), config.daily_budget_usd);

    let ollama = Arc::new(OllamaProvider::new(&config.ollama_url, 30)?);
    router.add_model(
        RouteTier::LocalFast,
        ModelConfig::local("llama-mini", "llama3.2:1b"),
        ollama.clone(),
    );
    router.add_model(
        RouteTier::LocalQuality,
        ModelConfig::local("qwen-coder", "qwen2.5-coder:7b"),
        ollama,
    );

    if let Some(api_key) = &config.anthropic_api_key {
        let anthropic = Arc::new(AnthropicProvider::new(api_key.clone(), 120)?);
        router.add_model(
            RouteTier::ApiFallback,
            ModelConfig::api("claude-sonnet", "claude-3-5-sonnet-20241022", 0.009),
            anthropic,
        );
    }

    Ok(router)
}

fn open_store(config: &Config) -> Result<GlyphStore, Error> {
    GlyphStore::open(&config.memory_db, &config.anchors_file)
}

fn parse_query(args: VecDeque<String>) -> Result<(GlyphQuery, VecDeque<String>), Error> {
    let mut query = GlyphQuery::new();
    let mut rest = VecDeque::new();
    let mut args = args;
    while let Some(arg) = args.pop_front() {
        if arg == "--limit" {
            let limit = args
                .pop_front()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| Error::validation("--limit requires a number"))?;
            query = query.limit(limit);
        } else if arg.contains('=') {
            let (key, value) = split_pair(&arg)?;
            query = query.apply_pair(key, value)?;
        } else {
            rest.push_back(arg);
        }
    }
    Ok((query, rest))
}

fn split_pair(pair: &str) -> Result<(&str, &str), Error> {
    pair.split_once('=')
        .ok_or_else(|| Error::validation(format!("expected key=value, got '{}'", pair)))
}

fn take_flag(args: &mut VecDeque<String>, flag: &str) -> bool {
    if let Some(pos) = args.iter().position(|a| a == flag) {
        args.remove(pos);
        true
    } else {
        false
    }
}

fn take_value(args: &mut VecDeque<String>, flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.remove(pos);
    args.remove(pos).map(|v| v.to_string())
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
        .block_on(future)
}
