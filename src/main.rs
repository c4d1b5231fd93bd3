//! # Brain CLI (`brain`)
//!
//! The `brain` binary fronts the knowledge-memory server: embedding
//! management, search, session state, bootstrap context, hook
//! operations, and configuration.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `brain serve` | Start the JSON HTTP server (plus config watcher) |
//! | `brain search "<query>"` | Search notes (semantic, keyword, hybrid, auto) |
//! | `brain embed note <id>` | Embed one note now |
//! | `brain embed catch-up` | Bring a project's embeddings up to date |
//! | `brain embed rebuild` | Drop and regenerate a project's embeddings |
//! | `brain bootstrap` | Print the session-initialization context |
//! | `brain session show\|set` | Inspect or update the current session |
//! | `brain hook ...` | Hook-binary operations with exit-code discipline |
//! | `brain config ...` | Show, edit, watch, migrate, or roll back config |
//!
//! Environment: `BRAIN_MODEL_URL`, `BRAIN_EMBED_MODEL`, `BRAIN_EMBED_DIMS`,
//! `BRAIN_SESSION_SECRET`, `BRAIN_PROJECT`, `EMBEDDING_CONCURRENCY`.

use anyhow::{bail, Context};
use brain::bootstrap::{BootstrapBuilder, BootstrapOptions};
use brain::config::ConfigManager;
use brain::hooks::HookService;
use brain::index::VectorIndex;
use brain::model_client::ModelClient;
use brain::pipeline::EmbeddingPipeline;
use brain::reconfigure::{self, LockManager, Reconfigurator};
use brain::rollback::{RollbackManager, RollbackTarget};
use brain::search::{SearchMode, SearchOptions, SearchService};
use brain::server::{self, AppState};
use brain::session::SessionStore;
use brain::store::{MarkdownStore, NoteStore};
use brain::watcher::ConfigWatcher;
use brain::workflow::{SessionEvent, WorkflowCoordinator};
use brain::{manifest, paths};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "brain",
    about = "Brain: a local-first knowledge-memory server over a markdown note store",
    version,
    long_about = "Brain embeds markdown notes through a local model server, keeps vectors in \
    SQLite, and exposes hybrid search, signed session state, session-protocol workflows, and \
    managed configuration via a CLI and a JSON HTTP server."
)]
struct Cli {
    /// Project to operate on. Defaults to `$BRAIN_PROJECT`, then the
    /// first configured project.
    #[arg(long, global = true)]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the JSON HTTP server.
    ///
    /// Runs crash recovery for interrupted config migrations, starts the
    /// config watcher, and serves the API until interrupted.
    Serve {
        /// Bind address.
        #[arg(long, default_value = "127.0.0.1:8421")]
        bind: SocketAddr,
    },

    /// Search notes.
    Search {
        /// The search query string.
        query: String,

        /// Search mode: `auto`, `semantic`, `keyword`, or `hybrid`.
        #[arg(long, default_value = "auto")]
        mode: String,

        /// Maximum number of primary results.
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Minimum cosine similarity for semantic hits.
        #[arg(long, default_value_t = 0.7)]
        threshold: f64,

        /// Relation-expansion hops to add after primary results.
        #[arg(long, default_value_t = 0)]
        depth: usize,

        /// Populate each result with its full markdown body.
        #[arg(long)]
        full_content: bool,
    },

    /// Manage note embeddings.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Print the session-initialization context document.
    Bootstrap {
        /// Lookback window, e.g. `5d`, `12h`.
        #[arg(long, default_value = "5d")]
        timeframe: String,

        /// Reference-chasing hops.
        #[arg(long, default_value_t = 3)]
        depth: usize,

        /// Expand full note bodies instead of `[[Title]]` references.
        #[arg(long)]
        full_content: bool,
    },

    /// Inspect or update the current session.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Hook-binary operations (JSON out, exit codes 0/1/2).
    Hook {
        #[command(subcommand)]
        action: HookAction,
    },

    /// Show, edit, watch, migrate, or roll back the configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed one note now and report the outcome.
    Note {
        /// Note permalink or title.
        id: String,
    },
    /// Embed everything missing or stale in the project.
    CatchUp,
    /// Drop the project's vectors and regenerate them all.
    ///
    /// Useful when switching embedding models or dimensions.
    Rebuild,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Print the current session state as JSON.
    Show,
    /// Apply a sparse JSON update to the current session.
    Set {
        /// Update object, e.g. `{"mode":"coding","activeTask":"..."}`.
        updates: String,
    },
}

#[derive(Subcommand)]
enum HookAction {
    /// Print the current session state (or `null`).
    SessionGet,
    /// Update the current session from a JSON object.
    SessionSet {
        /// Update object as JSON.
        updates: String,
    },
    /// Decide whether the gate admits a tool.
    GateCheck {
        /// Tool name, e.g. `Read` or `Write`.
        tool: String,
    },
    /// Print the bootstrap payload as JSON.
    Bootstrap,
    /// Validate a session log file.
    Validate {
        /// Path to the session log markdown file.
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as JSON.
    Show,
    /// Print one dotted-path value, e.g. `sync.delay_ms`.
    Get { path: String },
    /// Set a dotted-path value (JSON literal) and reconfigure.
    Set { path: String, value: String },
    /// Reset one dotted path, or everything with no argument.
    Reset { path: Option<String> },
    /// Watch the config file and apply valid edits until interrupted.
    Watch,
    /// One-shot migration from the legacy config location.
    Migrate,
    /// Restore a snapshot: `last-known-good` or `previous`.
    Rollback { target: String },
}

/// Everything a fully wired command needs.
struct Stack {
    store: Arc<dyn NoteStore>,
    index: Arc<VectorIndex>,
    pipeline: Arc<EmbeddingPipeline>,
    search: Arc<SearchService>,
    sessions: Arc<SessionStore>,
    bootstrap: Arc<BootstrapBuilder>,
    workflow: Arc<WorkflowCoordinator>,
    hooks: Arc<HookService>,
    project: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn index_path() -> anyhow::Result<PathBuf> {
    let dir = dirs::data_local_dir()
        .context("no local data directory on this platform")?
        .join("brain");
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join("brain.db"))
}

/// Resolve the note roots out of the config and assemble the service
/// graph around them.
async fn build_stack(project_flag: Option<String>) -> anyhow::Result<Stack> {
    let manager = ConfigManager::new()?;
    let config = manager.load()?;

    let mut roots: HashMap<String, PathBuf> = HashMap::new();
    for name in config.projects.keys() {
        match config.resolved_memories_path(name) {
            Ok(path) => {
                roots.insert(name.clone(), path);
            }
            Err(e) => tracing::warn!(project = %name, error = %e, "project root unresolved"),
        }
    }
    let project = project_flag
        .or_else(|| std::env::var("BRAIN_PROJECT").ok())
        .or_else(|| config.projects.keys().next().cloned())
        .unwrap_or_else(|| "main".to_string());
    if !roots.contains_key(&project) {
        let fallback = paths::safe_path(&format!(
            "{}/{project}",
            config.defaults.memories_location.trim_end_matches('/')
        ))?;
        std::fs::create_dir_all(&fallback)?;
        roots.insert(project.clone(), fallback);
    }

    let session_log_dir = roots[&project].join("sessions");
    let store: Arc<dyn NoteStore> = Arc::new(MarkdownStore::new(roots)?);

    let base_url = env_or("BRAIN_MODEL_URL", "http://127.0.0.1:11434");
    let model = env_or("BRAIN_EMBED_MODEL", "nomic-embed-text");
    let dims: usize = env_or("BRAIN_EMBED_DIMS", "768")
        .parse()
        .context("BRAIN_EMBED_DIMS must be a number")?;
    let embedder = Arc::new(ModelClient::new(&base_url, &model, dims)?);

    let index = Arc::new(VectorIndex::open(&index_path()?).await?);
    let pipeline = Arc::new(EmbeddingPipeline::new(
        embedder.clone(),
        Arc::clone(&index),
        Arc::clone(&store),
    ));
    let search = Arc::new(SearchService::new(
        embedder,
        Arc::clone(&index),
        Arc::clone(&store),
    ));
    let sessions = Arc::new(SessionStore::new(Arc::clone(&store))?);
    let bootstrap = Arc::new(BootstrapBuilder::new(
        Arc::clone(&store),
        Arc::clone(&pipeline),
    ));
    let workflow = Arc::new(
        WorkflowCoordinator::new(Arc::clone(&sessions), Arc::clone(&bootstrap))
            .with_session_log_dir(session_log_dir),
    );
    let hooks = Arc::new(HookService::new(
        Arc::clone(&sessions),
        Arc::clone(&workflow),
        Arc::clone(&bootstrap),
    ));

    Ok(Stack {
        store,
        index,
        pipeline,
        search,
        sessions,
        bootstrap,
        workflow,
        hooks,
        project,
    })
}

fn build_reconfigurator(
    manager: Arc<ConfigManager>,
    pipeline: Option<Arc<EmbeddingPipeline>>,
) -> anyhow::Result<(Arc<RollbackManager>, Arc<Reconfigurator>)> {
    let rollback = Arc::new(RollbackManager::new(Arc::clone(&manager))?);
    let mut reconfigurator = Reconfigurator::new(
        Arc::clone(&manager),
        Arc::clone(&rollback),
        Arc::new(LockManager::default()),
        paths::rollback_dir()?,
    );
    if let Some(pipeline) = pipeline {
        reconfigurator = reconfigurator.with_pipeline(pipeline);
    }
    Ok((rollback, Arc::new(reconfigurator)))
}

fn emit(output: brain::hooks::HookOutput) -> ! {
    println!("{}", output.body);
    std::process::exit(output.exit_code);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Config and validation commands run without the full service graph.
    match &cli.command {
        Commands::Config { action } => {
            return run_config(action).await;
        }
        Commands::Hook {
            action: HookAction::Validate { path },
        } => {
            let report = brain::protocol::validate_session_log(path);
            let body = serde_json::to_value(&report)?;
            println!("{body}");
            std::process::exit(if report.valid {
                brain::hooks::EXIT_OK
            } else {
                brain::hooks::EXIT_ERROR
            });
        }
        Commands::Hook {
            action: HookAction::GateCheck { tool },
        } => {
            // Fail-closed even when the stack cannot be built.
            match build_stack(cli.project.clone()).await {
                Ok(stack) => {
                    let output = stack.hooks.gate_check_output(&stack.project, tool).await;
                    emit(output);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "gate check without service stack");
                    let body = serde_json::json!({
                        "allowed": brain::hooks::is_read_only_tool(tool),
                        "reason": "session state unreadable",
                        "mode": "unknown",
                    });
                    println!("{body}");
                    let code = if brain::hooks::is_read_only_tool(tool) {
                        brain::hooks::EXIT_OK
                    } else {
                        brain::hooks::EXIT_WARNING
                    };
                    std::process::exit(code);
                }
            }
        }
        _ => {}
    }

    let stack = build_stack(cli.project).await?;

    match cli.command {
        Commands::Serve { bind } => {
            let recovered = manifest::recover(&paths::rollback_dir()?)?;
            if recovered > 0 {
                tracing::warn!(manifests = recovered, "recovered interrupted migrations");
            }

            let manager = Arc::new(ConfigManager::new()?);
            let (rollback, reconfigurator) =
                build_reconfigurator(Arc::clone(&manager), Some(Arc::clone(&stack.pipeline)))?;
            let watcher = ConfigWatcher::new(manager, reconfigurator, rollback).spawn()?;

            let state = Arc::new(AppState {
                search: Arc::clone(&stack.search),
                bootstrap: Arc::clone(&stack.bootstrap),
                hooks: Arc::clone(&stack.hooks),
                pipeline: Arc::clone(&stack.pipeline),
                default_project: stack.project.clone(),
            });
            let result = server::serve(state, bind).await;
            watcher.abort();
            result?;
        }

        Commands::Search {
            query,
            mode,
            limit,
            threshold,
            depth,
            full_content,
        } => {
            let mut opts = SearchOptions::new(&stack.project);
            opts.mode = SearchMode::parse(&mode)
                .with_context(|| format!("unknown search mode '{mode}'"))?;
            opts.limit = limit;
            opts.threshold = threshold;
            opts.depth = depth;
            opts.full_content = full_content;
            let results = stack.search.search(&query, &opts).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }

        Commands::Embed { action } => match action {
            EmbedAction::Note { id } => {
                let outcome = stack.pipeline.embed_note_now(&stack.project, &id).await?;
                println!("{outcome:?}");
            }
            EmbedAction::CatchUp => {
                let report = stack.pipeline.catch_up_project(&stack.project).await;
                println!("{}", serde_json::to_string_pretty(&report)?);
                if report.halted.is_some() {
                    bail!("catch-up halted: embedding dimensions changed");
                }
            }
            EmbedAction::Rebuild => {
                let permalinks = stack.store.list_directory(&stack.project, "").await?;
                for permalink in &permalinks {
                    stack.index.delete_note(permalink).await?;
                }
                tracing::info!(notes = permalinks.len(), "vectors dropped; re-embedding");
                let report = stack.pipeline.catch_up_project(&stack.project).await;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        },

        Commands::Bootstrap {
            timeframe,
            depth,
            full_content,
        } => {
            let mut opts = BootstrapOptions::new(&stack.project);
            opts.timeframe = timeframe;
            opts.depth = depth;
            opts.full_content = full_content;
            let payload = stack.bootstrap.build(&opts).await?;
            println!("{}", payload.markdown);
        }

        Commands::Session { action } => match action {
            SessionAction::Show => match stack.sessions.load_current(&stack.project).await? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => println!("null"),
            },
            SessionAction::Set { updates } => {
                let updates: serde_json::Value = serde_json::from_str(&updates)?;
                let current = stack
                    .sessions
                    .load_current(&stack.project)
                    .await?
                    .context("no active session to update")?;
                let outcome = stack
                    .workflow
                    .handle(SessionEvent::StateUpdate {
                        session_id: current.session_id,
                        project: stack.project.clone(),
                        updates,
                    })
                    .await?;
                println!("{}", serde_json::to_string_pretty(&outcome.session)?);
            }
        },

        Commands::Hook { action } => match action {
            HookAction::SessionGet => {
                emit(stack.hooks.session_state_get(&stack.project).await);
            }
            HookAction::SessionSet { updates } => {
                let updates: serde_json::Value = serde_json::from_str(&updates)?;
                emit(stack.hooks.session_state_set(&stack.project, updates).await);
            }
            HookAction::Bootstrap => {
                emit(stack.hooks.bootstrap_get(&stack.project).await);
            }
            // Handled before the stack was built.
            HookAction::GateCheck { .. } | HookAction::Validate { .. } => unreachable!(),
        },

        // Handled before the stack was built.
        Commands::Config { .. } => unreachable!(),
    }

    Ok(())
}

async fn run_config(action: &ConfigAction) -> anyhow::Result<()> {
    let manager = Arc::new(ConfigManager::new()?);

    match action {
        ConfigAction::Show => {
            let config = manager.load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Get { path } => {
            let config = manager.load()?;
            match manager.get(&config, path) {
                Some(value) => println!("{value}"),
                None => bail!("no such config path: {path}"),
            }
        }
        ConfigAction::Set { path, value } => {
            let config = manager.load()?;
            let parsed: serde_json::Value = serde_json::from_str(value)
                .unwrap_or_else(|_| serde_json::Value::String(value.clone()));
            let updated = manager.set(&config, path, parsed)?;
            let (_, reconfigurator) = build_reconfigurator(Arc::clone(&manager), None)?;
            let diff = reconfigurator.apply(updated).await?;
            println!("{}", serde_json::to_string_pretty(&diff)?);
        }
        ConfigAction::Reset { path } => {
            let config = manager.load()?;
            let updated = manager.reset(&config, path.as_deref())?;
            let (_, reconfigurator) = build_reconfigurator(Arc::clone(&manager), None)?;
            let diff = reconfigurator.apply(updated).await?;
            println!("{}", serde_json::to_string_pretty(&diff)?);
        }
        ConfigAction::Watch => {
            let recovered = manifest::recover(&paths::rollback_dir()?)?;
            if recovered > 0 {
                tracing::warn!(manifests = recovered, "recovered interrupted migrations");
            }
            let (rollback, reconfigurator) = build_reconfigurator(Arc::clone(&manager), None)?;
            let watcher = ConfigWatcher::new(manager, reconfigurator, rollback).spawn()?;
            tracing::info!("watching config; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            watcher.abort();
        }
        ConfigAction::Migrate => match reconfigure::migrate_legacy(&manager, None)? {
            Some(config) => println!("{}", serde_json::to_string_pretty(&config)?),
            None => println!("nothing to migrate"),
        },
        ConfigAction::Rollback { target } => {
            let target = RollbackTarget::parse(target)
                .with_context(|| format!("unknown rollback target '{target}'"))?;
            let rollback = RollbackManager::new(Arc::clone(&manager))?;
            let restored = rollback.rollback(target)?;
            println!("{}", serde_json::to_string_pretty(&restored)?);
        }
    }
    Ok(())
}
