//! Flowgate CLI
//!
//! Validates workflow definition files, runs the order scenario in memory and
//! drives entity workflows stored in NATS JetStream.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use flowgate::{
    basic_order, ActionExecutor, DefaultActionDispatcher, DefinitionRegistry, EngineConfig, InMemoryStateCache,
    InMemoryStorage, NatsStorage, NotificationBus, OrderWorkflow, TransitionRequest, Variables, WorkflowDefinition,
    WorkflowEngine,
};

#[derive(Parser)]
#[command(name = "flowgate")]
#[command(about = "Flowgate - state machine workflows for business entities")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (without extension is fine)
    #[arg(long, short, env = "FLOWGATE_CONFIG")]
    config: Option<String>,

    /// NATS server URL, overrides the configured one
    #[arg(long, env = "NATS_URL")]
    nats_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a definition file and report problems
    Validate { file: PathBuf },

    /// Print the states and transitions of a definition file
    Describe { file: PathBuf },

    /// Print the compiled order transition table
    Rules,

    /// Run the order scenario against in-memory storage
    Demo,

    /// Store a definition file in NATS and make it the active one for its code
    Define {
        file: PathBuf,

        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Create or replace an entity record in NATS
    PutEntity {
        id: String,

        /// Record fields as a JSON object
        fields: String,
    },

    /// Bind an entity to the active definition for a code
    Init {
        entity_id: String,

        #[arg(long, default_value = "basic_order")]
        code: String,
    },

    /// Fire an event against an entity
    Transition {
        entity_id: String,
        event: String,

        #[arg(long, default_value = "cli")]
        operator: String,

        #[arg(long, default_value = "")]
        role: String,

        #[arg(long, default_value = "")]
        reason: String,

        /// Request metadata as key=value; values are parsed as JSON when possible
        #[arg(long = "meta")]
        metadata: Vec<String>,
    },

    /// Print the current state of an entity
    State { entity_id: String },

    /// Print recent history, newest first
    History {
        entity_id: String,

        #[arg(long, default_value_t = 0)]
        limit: usize,
    },

    /// Reverse the most recent transition
    Rollback {
        entity_id: String,

        #[arg(long, default_value = "cli")]
        operator: String,

        #[arg(long, default_value = "")]
        reason: String,
    },

    /// List transitions leaving the current state and whether a role may take them
    Available {
        entity_id: String,

        #[arg(long, default_value = "")]
        role: String,
    },

    /// Drive orders through the compiled order workflow and the NATS status cache
    Order {
        #[command(subcommand)]
        action: OrderCommands,
    },
}

#[derive(Subcommand)]
enum OrderCommands {
    /// Print the current status, cache first
    Status { order_id: String },

    /// Fire an order event
    Fire {
        order_id: String,
        event: String,

        #[arg(long, default_value = "cli")]
        operator: String,

        #[arg(long, default_value = "")]
        role: String,

        #[arg(long, default_value = "")]
        reason: String,

        #[arg(long = "meta")]
        metadata: Vec<String>,
    },

    /// Record production progress, advancing the order when it crosses a threshold
    Progress {
        order_id: String,
        progress: f64,

        #[arg(long, default_value = "cli")]
        operator: String,
    },

    /// Reverse the most recent order transition
    Rollback {
        order_id: String,

        #[arg(long, default_value = "cli")]
        operator: String,

        #[arg(long, default_value = "")]
        reason: String,
    },

    /// Print cached history and rollback records, newest first
    History {
        order_id: String,

        #[arg(long, default_value_t = 0)]
        limit: usize,
    },

    /// Drop the cached status
    Invalidate { order_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let mut config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = cli.nats_url {
        config.nats.url = url;
    }

    match cli.command {
        Commands::Validate { file } => validate(&file)?,
        Commands::Describe { file } => describe(&read_definition(&file)?),
        Commands::Rules => print_rules(),
        Commands::Demo => demo(config).await?,
        command => run_stored(command, config).await?,
    }

    Ok(())
}

fn read_definition(file: &PathBuf) -> Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))
}

fn validate(file: &PathBuf) -> Result<()> {
    let definition = read_definition(file)?;
    if let Err(problem) = definition.validate() {
        bail!("{} is invalid: {}", file.display(), problem);
    }
    for state in definition.find_unreachable_states() {
        warn!(state = %state, "State is unreachable from the start state");
    }
    println!(
        "{} ({}) is valid: {} states, {} transitions",
        definition.name,
        definition.code,
        definition.states.len(),
        definition.transitions.len()
    );
    Ok(())
}

fn describe(definition: &WorkflowDefinition) {
    println!("{} [{}] v{}", definition.name, definition.code, definition.version);
    if !definition.description.is_empty() {
        println!("  {}", definition.description);
    }
    println!("States:");
    for state in &definition.states {
        println!("  {:<12} {:<8} {}", state.id, state.state_type.as_str(), state.name);
    }
    let events: Vec<String> = definition.events().iter().map(|e| e.to_string()).collect();
    println!("Events: {}", events.join(", "));
    println!("Transitions:");
    for t in &definition.transitions {
        let role = t.require_role.as_deref().map(|r| format!(" (role {})", r)).unwrap_or_default();
        println!(
            "  {} --{}--> {}{}  conditions: {}, actions: {}",
            t.from_state,
            t.event,
            t.to_state,
            role,
            t.conditions.len(),
            t.actions.len()
        );
    }
}

fn print_rules() {
    for rule in OrderWorkflow::transition_rules() {
        println!(
            "{:<10} -> {:<10} {:<16} {}{}{}",
            rule.from,
            rule.to,
            rule.event,
            rule.name,
            if rule.has_condition { "  [progress guard]" } else { "" },
            rule.require_role.map(|r| format!("  [role {}]", r)).unwrap_or_default()
        );
    }
}

fn parse_metadata(pairs: &[String]) -> Result<Variables> {
    let mut metadata = Variables::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("metadata '{}' is not key=value", pair);
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn demo_order() -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("order_no".to_string(), json!("O1"));
    fields.insert("status".to_string(), json!(0));
    fields.insert("progress".to_string(), json!(0));
    fields
}

/// The order scenario on both engines
async fn demo(config: EngineConfig) -> Result<()> {
    let storage = Arc::new(InMemoryStorage::new());
    let registry = DefinitionRegistry::new(storage.clone(), config.store_timeout());
    let definition = registry.create_definition(basic_order(), "demo").await?;
    registry.activate_definition(&definition.id).await?;

    let bus = NotificationBus::default();
    let mut notifications = bus.subscribe();
    let dispatcher = Arc::new(DefaultActionDispatcher::new(bus, config.webhook_timeout()));
    let actions = ActionExecutor::new(dispatcher, config.store_timeout()).with_instance_store(storage.clone());
    let engine = WorkflowEngine::new(storage.clone(), storage.clone(), actions, config.clone())
        .with_entities(storage.clone());

    println!("== definition-driven runtime ==");
    storage.insert_entity("O1", demo_order())?;
    let instance = engine.init_workflow("O1", "basic_order").await?;
    println!("init                -> {}", instance.current_state);

    let steps: [(&str, &str, Option<f64>); 4] = [
        ("submit_order", "sales", None),
        ("start_cutting", "", None),
        ("complete", "", Some(0.8)),
        ("complete", "", Some(1.0)),
    ];
    for (event, role, progress) in steps {
        let mut request = TransitionRequest::new("O1", event).operator("u1").role(role);
        if let Some(p) = progress {
            request = request.metadata("progress", json!(p));
        }
        match engine.transition(request).await {
            Ok(instance) => println!("{:<19} -> {}", event, instance.current_state),
            Err(e) => println!("{:<19} !! {}", event, e),
        }
    }
    if let Err(e) = engine.rollback("O1", "u1", "demo").await {
        println!("rollback            !! {}", e);
    }
    while let Ok(n) = notifications.try_recv() {
        println!("notification [{}] {}", n.channel, n.message);
    }
    for entry in engine.get_history("O1", 0).await? {
        println!("  history: {} -> {} via {}", entry.from_state, entry.to_state, entry.event);
    }

    println!("== order fast path ==");
    let orders = Arc::new(InMemoryStorage::new());
    orders.insert_entity("O1", demo_order())?;
    let cache = Arc::new(InMemoryStateCache::new());
    let fast = OrderWorkflow::new(orders, cache.clone(), config);

    println!("status              -> {}", fast.get_current_status("O1").await?);
    fast.transition(TransitionRequest::new("O1", "submit_order").operator("u1")).await?;
    println!("update_progress 0.4 -> {}", fast.update_progress("O1", 0.4, "u1").await?);
    println!("update_progress 1.0 -> {}", fast.update_progress("O1", 1.0, "u1").await?);
    cache.clear();
    println!("status (cold cache) -> {}", fast.get_current_status("O1").await?);
    if let Err(e) = fast.rollback("O1", "u1", "demo").await {
        println!("rollback            !! {}", e);
    }
    for entry in fast.get_history("O1", 0).await? {
        println!("  history: {} -> {} via {}", entry.from_state, entry.to_state, entry.event);
    }
    Ok(())
}

async fn run_stored(command: Commands, config: EngineConfig) -> Result<()> {
    let storage = Arc::new(NatsStorage::connect(config.nats.clone()).await?);
    info!(url = %config.nats.url, "Connected to NATS");

    let registry = DefinitionRegistry::new(storage.clone(), config.store_timeout());
    let dispatcher = Arc::new(DefaultActionDispatcher::new(NotificationBus::default(), config.webhook_timeout()));
    let actions = ActionExecutor::new(dispatcher, config.store_timeout()).with_instance_store(storage.clone());
    let engine = WorkflowEngine::new(storage.clone(), storage.clone(), actions, config.clone())
        .with_entities(storage.clone());

    match command {
        Commands::Define { file, actor } => {
            let created = registry.create_definition(read_definition(&file)?, &actor).await?;
            let active = registry.activate_definition(&created.id).await?;
            println!("{} {} v{} active", active.code, active.id, active.version);
        }
        Commands::PutEntity { id, fields } => {
            let fields: Map<String, Value> = serde_json::from_str(&fields).context("entity fields must be a JSON object")?;
            storage.insert_entity(&id, fields).await?;
            println!("stored {}", id);
        }
        Commands::Init { entity_id, code } => {
            let instance = engine.init_workflow(&entity_id, &code).await?;
            println!("{} -> {} (instance {})", entity_id, instance.current_state, instance.id);
        }
        Commands::Transition {
            entity_id,
            event,
            operator,
            role,
            reason,
            metadata,
        } => {
            let mut request = TransitionRequest::new(entity_id.as_str(), event)
                .operator(operator)
                .role(role)
                .reason(reason);
            request.metadata = parse_metadata(&metadata)?;
            let instance = engine.transition(request).await?;
            println!("{} -> {}", entity_id, instance.current_state);
        }
        Commands::State { entity_id } => {
            println!("{}", engine.get_state(&entity_id).await?);
        }
        Commands::History { entity_id, limit } => {
            print_json(&engine.get_history(&entity_id, limit).await?)?;
        }
        Commands::Rollback {
            entity_id,
            operator,
            reason,
        } => {
            let instance = engine.rollback(&entity_id, &operator, &reason).await?;
            println!("{} -> {}", entity_id, instance.current_state);
        }
        Commands::Available { entity_id, role } => {
            print_json(&engine.explain_transitions(&entity_id, &role, &Variables::new()).await?)?;
        }
        Commands::Order { action } => {
            let cache = Arc::new(storage.open_cache(config.log_ttl()).await?);
            let orders = OrderWorkflow::new(storage.clone(), cache, config);
            run_order(&orders, action).await?;
        }
        Commands::Validate { .. } | Commands::Describe { .. } | Commands::Rules | Commands::Demo => {
            bail!("command does not use stored workflows")
        }
    }
    Ok(())
}

async fn run_order(orders: &OrderWorkflow, action: OrderCommands) -> Result<()> {
    match action {
        OrderCommands::Status { order_id } => {
            let status = orders.get_current_status(&order_id).await?;
            println!("{} {} ({})", order_id, status, status.name());
        }
        OrderCommands::Fire {
            order_id,
            event,
            operator,
            role,
            reason,
            metadata,
        } => {
            let mut request = TransitionRequest::new(order_id.as_str(), event)
                .operator(operator)
                .role(role)
                .reason(reason);
            request.metadata = parse_metadata(&metadata)?;
            println!("{} -> {}", order_id, orders.transition(request).await?);
        }
        OrderCommands::Progress {
            order_id,
            progress,
            operator,
        } => {
            println!("{} -> {}", order_id, orders.update_progress(&order_id, progress, &operator).await?);
        }
        OrderCommands::Rollback {
            order_id,
            operator,
            reason,
        } => {
            println!("{} -> {}", order_id, orders.rollback(&order_id, &operator, &reason).await?);
        }
        OrderCommands::History { order_id, limit } => {
            print_json(&json!({
                "history": orders.get_history(&order_id, limit).await?,
                "rollbacks": orders.get_rollback_history(&order_id, limit).await?,
            }))?;
        }
        OrderCommands::Invalidate { order_id } => {
            orders.invalidate_cache(&order_id).await?;
            println!("invalidated {}", order_id);
        }
    }
    Ok(())
}
