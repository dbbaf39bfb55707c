use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustyline::error::ReadlineError;
use serde_json::{Map, Value};
use soma_core::action::queue::spawn_consumer;
use soma_core::action::{ActionAtom, ActionExecutor, ActionQueue, ActionReport, Origin};
use soma_core::blueprint::{Advance, BlueprintInstance, StepResult};
use soma_core::capability::{CompletionClient, LlmCompletion};
use soma_core::catalog::db::{self, PgCatalogSource};
use soma_core::catalog::{CatalogSource, DefinitionKind, StaticCatalogSource};
use soma_core::config::SomaCfg;
use soma_core::error::ExecutionError;
use soma_core::runtime::{Services, ShutdownGuard};
use soma_core::strategy::{Activation, Candidate, StrategyManager};
use soma_core::types::{ConversationEvent, Event, SceneEvent};
use soma_llm::provider::{ChatMessage, LlmProvider, ToolDefinition};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DB_CONNECT_TIMEOUT_SECS: u64 = 3;
const REPORT_CHANNEL_CAPACITY: usize = 64;
const ACTIVATION_PROMPT: &str = "You decide whether the user's latest message asks for one of the \
given functions. Call the single best matching function with its arguments, or answer in plain \
text if none applies.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing: write to file when RUST_LOG is set (the REPL owns stdout)
    if std::env::var("RUST_LOG").is_ok() {
        let file = std::fs::File::create("/tmp/soma.log")?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(fmt::layer().json().with_target(true).with_writer(file))
            .init();
    }

    let mut notices = Vec::new();
    let pool = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let connect_result = tokio::time::timeout(
                Duration::from_secs(DB_CONNECT_TIMEOUT_SECS),
                sqlx::postgres::PgPoolOptions::new().max_connections(8).connect(&url),
            )
            .await;
            match connect_result {
                Ok(Ok(pool)) => match sqlx::migrate!("../../migrations").run(&pool).await {
                    Ok(()) => {
                        tracing::info!("database connected and migrations applied");
                        Some(pool)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "database migration failed, running without database");
                        notices.push("database migration failed, running without database".to_string());
                        None
                    }
                },
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "cannot connect to DATABASE_URL, running without database");
                    notices.push("cannot connect to DATABASE_URL, running without database".to_string());
                    None
                }
                Err(_) => {
                    tracing::warn!(timeout_secs = DB_CONNECT_TIMEOUT_SECS, "database connect timed out");
                    notices.push(format!("database connect timed out ({DB_CONNECT_TIMEOUT_SECS}s), running without database"));
                    None
                }
            }
        }
        Err(_) => None,
    };

    let cfg = match &pool {
        Some(pool) => SomaCfg::load(pool).await?,
        None => SomaCfg::default(),
    };

    let source: Arc<dyn CatalogSource> = match (&pool, std::env::var("SOMA_CATALOG_PATH")) {
        (Some(pool), _) => Arc::new(PgCatalogSource::new(pool.clone())),
        (None, Ok(path)) => match StaticCatalogSource::from_json_file(Path::new(&path)) {
            Ok(source) => Arc::new(source),
            Err(e) => {
                notices.push(format!("cannot read catalog {path}: {e}"));
                Arc::new(StaticCatalogSource::new())
            }
        },
        (None, Err(_)) => {
            notices.push("no DATABASE_URL or SOMA_CATALOG_PATH set, catalogs are empty".to_string());
            Arc::new(StaticCatalogSource::new())
        }
    };

    let completion: Option<Arc<dyn CompletionClient>> = match soma_llm::http::from_env() {
        Some(provider) => {
            let provider: Arc<dyn LlmProvider> = Arc::new(provider);
            Some(Arc::new(LlmCompletion::new(provider)))
        }
        None => None,
    };
    if completion.is_none() {
        notices.push("no SOMA_LLM_MODEL / SOMA_LLM_API_KEY set, llm routing disabled".to_string());
    }

    let queue_capacity = cfg.action_queue_capacity;
    let mut services = Services::new(cfg, source);
    if let Some(completion) = &completion {
        services = services.with_completion(completion.clone());
    }
    let services = Arc::new(services);
    services.refresh_all().await;

    let shutdown = ShutdownGuard::new();
    shutdown.spawn_signal_listener();
    let token = shutdown.token();
    let refreshers = services.spawn_refreshers(token.clone());

    let (queue, queue_rx) = ActionQueue::channel(queue_capacity);
    let (report_tx, report_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
    let consumer = spawn_consumer(queue_rx, Arc::new(PrintingExecutor), Some(report_tx), token.clone());

    let aid = std::env::var("SOMA_AID").unwrap_or_else(|_| "soma".to_string());
    let manager = StrategyManager::new(aid, services.clone(), queue);
    manager.load();

    let mut repl = Repl { manager, services, pool, completion, active: None, offered: Vec::new() };
    let result = repl.run(report_rx, token.clone(), notices).await;

    shutdown.cancel();
    let _ = consumer.await;
    for handle in refreshers {
        let _ = handle.await;
    }
    result
}

/// Stand-in executor: prints each atom and echoes its inputs as outputs.
struct PrintingExecutor;

#[async_trait]
impl ActionExecutor for PrintingExecutor {
    async fn execute_atom(&self, atom: &ActionAtom, _event: &Event) -> Result<Map<String, Value>, ExecutionError> {
        let values = atom.params.values();
        println!("\r[action] {} ({}) {}", atom.atom_id, atom.action_type, Value::Object(values.clone()));
        Ok(values)
    }
}

struct Repl {
    manager: StrategyManager,
    services: Arc<Services>,
    pool: Option<sqlx::PgPool>,
    completion: Option<Arc<dyn CompletionClient>>,
    active: Option<BlueprintInstance>,
    offered: Vec<Candidate>,
}

impl Repl {
    async fn run(
        &mut self,
        mut report_rx: mpsc::Receiver<ActionReport>,
        token: CancellationToken,
        notices: Vec<String>,
    ) -> anyhow::Result<()> {
        for notice in notices {
            println!("note: {notice}");
        }
        println!(
            "soma ready for {} ({} strategies bound). /help for commands.",
            self.manager.aid(),
            self.manager.bound_strategies().len()
        );

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<InputEvent>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
        spawn_input_thread(line_tx, ready_rx);
        request_next_prompt(&ready_tx);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                report = report_rx.recv() => {
                    let Some(report) = report else { break };
                    self.on_report(report);
                }
                line = line_rx.recv() => {
                    let Some(line) = line else { break };
                    match line {
                        InputEvent::Line(line) => {
                            let text = line.trim();
                            if matches!(text, "/q" | "/exit" | "/quit") {
                                break;
                            }
                            if !text.is_empty()
                                && let Err(e) = self.handle(text).await
                            {
                                println!("error: {e}");
                            }
                            request_next_prompt(&ready_tx);
                        }
                        InputEvent::Interrupted => {
                            token.cancel();
                            break;
                        }
                        InputEvent::Eof => break,
                        InputEvent::Error(err) => {
                            eprintln!("input error: {err}");
                            break;
                        }
                    }
                }
            }
        }
        drop(ready_tx);
        println!();
        Ok(())
    }

    fn on_report(&mut self, report: ActionReport) {
        match &report.result {
            Ok(_) => tracing::debug!(node_id = %report.node_id, "action completed"),
            Err(e) => println!("\r[action] {} failed: {e}", report.node_id),
        }
        if let (Origin::Blueprint { instance_id, .. }, Ok(outputs)) = (&report.origin, report.result)
            && let Some(active) = self.active.as_mut()
            && active.instance_id == *instance_id
        {
            active.record_outputs(&report.node_id, outputs);
        }
    }

    async fn handle(&mut self, text: &str) -> anyhow::Result<()> {
        let (command, rest) = text.split_once(' ').map_or((text, ""), |(c, r)| (c, r.trim()));
        match command {
            "/help" => print_help(),
            "/scene" => {
                let (name, payload) = rest.split_once(' ').map_or((rest, ""), |(n, p)| (n, p.trim()));
                if name.is_empty() {
                    anyhow::bail!("usage: /scene <event_name> [json payload]");
                }
                let mut event = SceneEvent::new(self.manager.aid(), name);
                if !payload.is_empty() {
                    event = event.with_payload(serde_json::from_str(payload)?);
                }
                self.on_scene(event.into()).await;
            }
            "/activate" => {
                let (strategy_id, args) = rest.split_once(' ').map_or((rest, ""), |(s, a)| (s, a.trim()));
                let arguments = if args.is_empty() { Map::new() } else { parse_object(args)? };
                let event: Event = ConversationEvent::new(self.manager.aid(), "user", text).into();
                self.activate(strategy_id, &event, &arguments).await;
            }
            "/cancel" => match self.active.take() {
                Some(active) => println!("blueprint {} cancelled", active.bp_id()),
                None => println!("no active blueprint"),
            },
            "/status" => self.print_status(),
            "/reload" => {
                let ok = self.services.refresh_all().await;
                let bound = self.manager.load();
                println!("{ok} catalogs refreshed, {bound} strategies bound");
            }
            "/import" => self.import(rest).await?,
            "/remove" => self.remove(rest).await?,
            _ if command.starts_with('/') => println!("unknown command {command}, try /help"),
            _ => {
                let event: Event = ConversationEvent::new(self.manager.aid(), "user", text).into();
                self.on_conversation(event).await;
            }
        }
        Ok(())
    }

    async fn on_scene(&mut self, event: Event) {
        if let Some(active) = self.active.as_mut() {
            let advance = active.advance(&event).await;
            self.after_advance(advance);
        }
        let outcome = self.manager.dispatch_scene_event(&event).await;
        if outcome.fired.is_empty() {
            println!("no strategy fired");
        } else {
            println!("fired: {}", outcome.fired.join(", "));
        }
        for instance in outcome.blueprints {
            self.begin(instance, &event).await;
        }
    }

    async fn on_conversation(&mut self, event: Event) {
        if let Some(active) = self.active.as_mut() {
            let advance = active.advance(&event).await;
            self.after_advance(advance);
        }

        self.offered = self.manager.dispatch_conversation_event(&event).await;
        if self.offered.is_empty() {
            return;
        }
        let Some(completion) = self.completion.clone() else {
            println!("candidate strategies (use /activate <id> [json]):");
            for c in &self.offered {
                println!("  {}  {}: {}", c.strategy_id, c.function.name, c.function.description);
            }
            return;
        };

        let tools: Vec<ToolDefinition> = self.offered.iter().map(|c| c.function.to_tool()).collect();
        let context = [ChatMessage::user(event.description())];
        match completion.generate(ACTIVATION_PROMPT, &context, &tools).await {
            Ok(Some(call)) => {
                let chosen = self.offered.iter().find(|c| c.function.name == call.name).map(|c| c.strategy_id.clone());
                match chosen {
                    Some(strategy_id) => {
                        let arguments = call.arguments.as_object().cloned().unwrap_or_default();
                        self.activate(&strategy_id, &event, &arguments).await;
                    }
                    None => tracing::warn!(function = %call.name, "model chose a function that was not offered"),
                }
            }
            Ok(None) => println!("no strategy chosen"),
            Err(e) => println!("activation decision failed: {e}"),
        }
    }

    async fn activate(&mut self, strategy_id: &str, event: &Event, arguments: &Map<String, Value>) {
        match self.manager.activate_strategy(strategy_id, event, arguments).await {
            Some(Activation::Enqueued { node_id }) => println!("activated {strategy_id}: {node_id} queued"),
            Some(Activation::Blueprint(instance)) => self.begin(instance, event).await,
            None => println!("{strategy_id} was not activated"),
        }
    }

    /// Start a fired blueprint. One activation at a time; a newer one
    /// replaces the running one.
    async fn begin(&mut self, mut instance: BlueprintInstance, event: &Event) {
        if let Some(previous) = &self.active {
            println!("blueprint {} replaced by {}", previous.bp_id(), instance.bp_id());
        }
        println!("blueprint {} started", instance.bp_id());
        let advance = instance.start(event).await;
        self.active = Some(instance);
        self.after_advance(advance);
    }

    fn after_advance(&mut self, advance: Advance) {
        let Some(active) = &self.active else { return };
        match advance.result {
            StepResult::Ignore => {}
            StepResult::Executed => println!("blueprint {} now at {}", active.bp_id(), active.current_node()),
            StepResult::Finished => println!("blueprint {} finished", active.bp_id()),
            StepResult::SelfKill => println!("blueprint {} cancelled itself", active.bp_id()),
        }
        for function in &advance.functions {
            println!("  ({}: {})", function.name, function.description.lines().next().unwrap_or_default());
        }
        if advance.result.is_terminal() {
            self.active = None;
        }
    }

    fn print_status(&self) {
        println!("aid: {}", self.manager.aid());
        println!("strategies: {}", self.manager.bound_strategies().join(", "));
        println!("lui triggers: {}", self.manager.lui_triggers().join(", "));
        match &self.active {
            Some(active) => println!(
                "blueprint: {} at {} ({} idle turns)",
                active.bp_id(),
                active.current_node(),
                active.unactive_turns()
            ),
            None => println!("blueprint: none"),
        }
    }

    /// Load a catalog document into the database, then refresh.
    async fn import(&mut self, path: &str) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else {
            anyhow::bail!("/import needs DATABASE_URL");
        };
        let text = std::fs::read_to_string(path)?;
        let doc: Map<String, Value> = parse_object(&text)?;
        let mut written = 0;
        for (key, items) in doc {
            let Some(kind) = DefinitionKind::from_name(&key) else {
                println!("skipping unknown kind {key}");
                continue;
            };
            for item in items.as_array().into_iter().flatten() {
                match kind.definition_id(item) {
                    Some(id) => {
                        db::upsert(pool, kind, id, item).await?;
                        written += 1;
                    }
                    None => println!("skipping {} without {}", kind.as_str(), kind.id_field()),
                }
            }
        }
        self.services.refresh_all().await;
        let bound = self.manager.load();
        println!("{written} definitions imported, {bound} strategies bound");
        Ok(())
    }

    async fn remove(&mut self, rest: &str) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else {
            anyhow::bail!("/remove needs DATABASE_URL");
        };
        let Some((kind, id)) = rest.split_once(' ') else {
            anyhow::bail!("usage: /remove <kind> <id>");
        };
        let kind = DefinitionKind::from_name(kind).ok_or_else(|| anyhow::anyhow!("unknown kind {kind}"))?;
        if db::delete(pool, kind, id.trim()).await? {
            self.services.refresh_all().await;
            self.manager.load();
            println!("removed {} {}", kind.as_str(), id.trim());
        } else {
            println!("no such {} {}", kind.as_str(), id.trim());
        }
        Ok(())
    }
}

fn parse_object(text: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str(text)? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("expected a JSON object"),
    }
}

fn print_help() {
    println!("/scene <event_name> [json]     dispatch a scene event");
    println!("<text>                         a conversational turn");
    println!("/activate <strategy_id> [json] fire an offered strategy");
    println!("/cancel                        drop the active blueprint");
    println!("/status                        bindings and blueprint state");
    println!("/reload                        refresh catalogs and rebind");
    println!("/import <file>                 upsert a catalog document into the database");
    println!("/remove <kind> <id>            delete one stored definition");
    println!("/quit");
    let _ = io::stdout().flush();
}

fn request_next_prompt(ready_tx: &std::sync::mpsc::Sender<()>) {
    let _ = ready_tx.send(());
}

fn spawn_input_thread(line_tx: mpsc::UnboundedSender<InputEvent>, ready_rx: std::sync::mpsc::Receiver<()>) {
    std::thread::spawn(move || {
        let mut editor = match rustyline::DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                let _ = line_tx.send(InputEvent::Error(e.to_string()));
                return;
            }
        };

        while ready_rx.recv().is_ok() {
            match editor.readline("soma> ") {
                Ok(line) => {
                    let _ = editor.add_history_entry(line.as_str());
                    if line_tx.send(InputEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    let _ = line_tx.send(InputEvent::Interrupted);
                    break;
                }
                Err(ReadlineError::Eof) => {
                    let _ = line_tx.send(InputEvent::Eof);
                    break;
                }
                Err(e) => {
                    let _ = line_tx.send(InputEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    });
}

enum InputEvent {
    Line(String),
    Interrupted,
    Eof,
    Error(String),
}
