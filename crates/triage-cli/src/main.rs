//! Triage CLI - AI-assisted support ticket triage

use std::sync::Arc;

use clap::{Parser, Subcommand};
use triage_core::config::Config;
use triage_core::embedding::{EmbeddingBackend, SimpleEmbedder};
use triage_core::knowledge::KnowledgeGraphStore;
use triage_core::llm::{InferenceBackend, LlmClient, UnavailableBackend};
use triage_core::mail::TracingMailer;
use triage_core::storage::Database;
use triage_core::tickets::{NewTicket, Ticket, TicketStore, parse_ticket_id};
use triage_core::users::{NewUser, Role, UserStore};
use triage_core::workflow::{
    Dispatcher, EngineConfig, EventEnvelope, RunJournal, RunResult, SqliteRunJournal, TicketCreated,
    TicketResolved, TriageEvent, TriageServices, UserSignup, WorkflowEngine,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "triage")]
#[command(author, version, about = "AI-assisted support ticket triage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tickets
    Tickets {
        #[command(subcommand)]
        action: TicketAction,
    },

    /// Manage users
    Users {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Inspect workflow runs
    Runs {
        #[command(subcommand)]
        action: RunAction,
    },

    /// Find resolved tickets similar to a piece of text
    Similar {
        /// Text to search for
        text: String,
        /// Number of results
        #[arg(short, long, default_value_t = 3)]
        k: usize,
    },

    /// Knowledge graph inspection
    Graph {
        #[command(subcommand)]
        action: GraphAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum TicketAction {
    /// Open a ticket and run triage on it
    New {
        title: String,
        #[arg(short, long)]
        description: String,
        /// ID of the user opening the ticket
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Show ticket details
    Show { id: String },
    /// List tickets, newest first
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Resolve a ticket and store it in the knowledge graph
    Resolve { id: String, resolution: String },
}

#[derive(Subcommand)]
enum UserAction {
    /// Register a user and send the welcome mail
    Add {
        email: String,
        /// user, moderator or admin
        #[arg(short, long, default_value = "user")]
        role: String,
        /// Comma-separated skills
        #[arg(short, long, value_delimiter = ',')]
        skills: Vec<String>,
    },
    /// Change a user's role or skills
    Update {
        email: String,
        /// user, moderator or admin
        #[arg(short, long)]
        role: Option<String>,
        /// Comma-separated skills, replacing the current ones
        #[arg(short, long, value_delimiter = ',')]
        skills: Option<Vec<String>>,
    },
    /// List users
    List,
}

#[derive(Subcommand)]
enum RunAction {
    /// List recent runs
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a run and its completed steps
    Show { id: String },
}

#[derive(Subcommand)]
enum GraphAction {
    /// Show node and edge counts
    Stats,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

/// Stores, workflows and dispatcher wired for one CLI invocation
struct App {
    db: Database,
    services: Arc<TriageServices>,
    engine: Arc<WorkflowEngine>,
    dispatcher: Dispatcher,
}

impl App {
    async fn open(quiet: bool) -> anyhow::Result<Self> {
        let config = Config::load()?;
        config.validate()?;
        let db = Database::default().await?;

        let mut retries = config.workflow.retries;
        let (inference, embedder): (Arc<dyn InferenceBackend>, Arc<dyn EmbeddingBackend>) =
            match config.llm.resolved_api_key()? {
                Some(key) => {
                    let client = Arc::new(
                        LlmClient::builder()
                            .config(config.llm.clone())
                            .embedding(config.embedding.clone())
                            .api_key(key)
                            .build()?,
                    );
                    (
                        client.clone() as Arc<dyn InferenceBackend>,
                        client as Arc<dyn EmbeddingBackend>,
                    )
                }
                None => {
                    // Without a model there is nothing to retry for
                    retries = 0;
                    if !quiet {
                        warn!("API key not configured, tickets are assigned without AI analysis");
                    }
                    (
                        Arc::new(UnavailableBackend::new("no API key configured"))
                            as Arc<dyn InferenceBackend>,
                        Arc::new(SimpleEmbedder::new(config.embedding.dimensions))
                            as Arc<dyn EmbeddingBackend>,
                    )
                }
            };

        let mailer = Arc::new(TracingMailer::new(config.mail.from.clone()));
        let services = Arc::new(TriageServices::sqlite(
            db.pool().clone(),
            &config,
            inference,
            embedder,
            mailer,
        ));

        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(SqliteRunJournal::new(db.pool().clone())),
            EngineConfig::from(&config.workflow),
        ));
        let dispatcher =
            Dispatcher::with_triage_workflows(engine.clone(), services.clone(), retries);

        Ok(Self {
            db,
            services,
            engine,
            dispatcher,
        })
    }

    async fn dispatch(&self, event: TriageEvent) -> anyhow::Result<Vec<RunResult>> {
        let envelope = EventEnvelope::new(event)?;
        let results = self.dispatcher.dispatch_and_wait(envelope).await?;
        for result in &results {
            info!(run_id = %result.run_id, status = %result.status, "Run finished");
        }
        Ok(results)
    }

    async fn close(self) {
        self.dispatcher.shutdown().await;
        self.db.close().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("triage=info".parse()?)
                .add_directive("triage_core=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Tickets { action } => {
            let app = App::open(cli.quiet).await?;
            let result = cmd_tickets(&app, action, cli.format, cli.quiet).await;
            app.close().await;
            result
        }

        Commands::Users { action } => {
            let app = App::open(cli.quiet).await?;
            let result = cmd_users(&app, action, cli.format, cli.quiet).await;
            app.close().await;
            result
        }

        Commands::Runs { action } => {
            let app = App::open(cli.quiet).await?;
            let result = cmd_runs(&app, action, cli.format).await;
            app.close().await;
            result
        }

        Commands::Similar { text, k } => {
            let app = App::open(cli.quiet).await?;
            let result = cmd_similar(&app, &text, k, cli.format, cli.quiet).await;
            app.close().await;
            result
        }

        Commands::Graph { action } => {
            let app = App::open(cli.quiet).await?;
            let result = cmd_graph(&app, action, cli.format).await;
            app.close().await;
            result
        }

        Commands::Config { action } => cmd_config(action, cli.quiet),

        Commands::Doctor => cmd_doctor(cli.quiet).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn print_ticket(ticket: &Ticket) {
    println!("Ticket: {}", ticket.title);
    println!("  ID: {}", ticket.id);
    println!("  Status: {}", ticket.status);
    if let Some(priority) = ticket.priority {
        println!("  Priority: {}", priority);
    }
    if !ticket.related_skills.is_empty() {
        println!("  Skills: {}", ticket.related_skills.join(", "));
    }
    if let Some(user) = &ticket.assigned_to {
        println!("  Assigned to: {}", user);
    }
    println!("  Description: {}", ticket.description);
    if let Some(notes) = &ticket.helpful_notes {
        println!("  Notes: {}", notes);
    }
    if let Some(resolution) = &ticket.resolution {
        println!("  Resolution: {}", resolution);
    }
    println!("  Created: {}", ticket.created_at.format("%Y-%m-%d %H:%M:%S"));
}

fn print_runs(results: &[RunResult]) {
    for r in results {
        match &r.error {
            Some(error) => println!("  Run {} {} after {} attempt(s): {}", r.run_id, r.status, r.attempts, error),
            None => println!("  Run {} {} after {} attempt(s)", r.run_id, r.status, r.attempts),
        }
    }
}

fn parse_role(role: &str) -> anyhow::Result<Role> {
    Role::parse(role)
        .ok_or_else(|| anyhow::anyhow!("Invalid role '{}'. Use user, moderator or admin.", role))
}

async fn find_ticket(app: &App, id: &str) -> anyhow::Result<Ticket> {
    let id = parse_ticket_id(id)?;
    app.services.tickets.find_by_id(&id).await?.ok_or_else(|| {
        anyhow::anyhow!(
            "Ticket '{}' not found. Run `triage tickets list` to see all tickets.",
            id
        )
    })
}

async fn cmd_tickets(
    app: &App,
    action: TicketAction,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    match action {
        TicketAction::New {
            title,
            description,
            created_by,
        } => {
            let mut new = NewTicket::new(title, description);
            if let Some(user) = created_by {
                new = new.created_by(user);
            }
            let ticket = app.services.tickets.create(&new).await?;
            if !quiet && format == OutputFormat::Text {
                println!("Ticket created: {}", ticket.id);
            }

            let results = app
                .dispatch(TriageEvent::TicketCreated(TicketCreated {
                    ticket_id: ticket.id.clone(),
                    title: ticket.title.clone(),
                    description: ticket.description.clone(),
                    created_by: ticket.created_by.clone(),
                }))
                .await?;

            let ticket = find_ticket(app, &ticket.id).await?;
            match format {
                OutputFormat::Json => print_json(&ticket)?,
                OutputFormat::Text if !quiet => {
                    print_runs(&results);
                    println!();
                    print_ticket(&ticket);
                }
                OutputFormat::Text => println!("{}", ticket.id),
            }
        }
        TicketAction::Show { id } => {
            let ticket = find_ticket(app, &id).await?;
            match format {
                OutputFormat::Json => print_json(&ticket)?,
                OutputFormat::Text => print_ticket(&ticket),
            }
        }
        TicketAction::List { limit } => {
            let tickets = app.services.tickets.list(limit).await?;
            if format == OutputFormat::Json {
                return print_json(&tickets);
            }
            if tickets.is_empty() {
                if !quiet {
                    println!("No tickets found.");
                    println!("\nOpen one with: triage tickets new <title> --description <text>");
                }
            } else {
                if !quiet {
                    println!("Tickets:");
                }
                for t in tickets {
                    let priority = t.priority.map(|p| p.as_str()).unwrap_or("-");
                    println!("  {} - {} [{}] ({})", short_id(&t.id), t.title, t.status, priority);
                }
            }
        }
        TicketAction::Resolve { id, resolution } => {
            let ticket = find_ticket(app, &id).await?;
            let ticket = app.services.tickets.resolve(&ticket.id, &resolution).await?;

            let results = app
                .dispatch(TriageEvent::TicketResolved(TicketResolved {
                    ticket_id: ticket.id.clone(),
                    title: ticket.title.clone(),
                    description: ticket.description.clone(),
                    resolution,
                    related_skills: ticket.related_skills.clone(),
                }))
                .await?;

            match format {
                OutputFormat::Json => print_json(&ticket)?,
                OutputFormat::Text if !quiet => {
                    println!("Ticket '{}' resolved.", ticket.id);
                    print_runs(&results);
                }
                OutputFormat::Text => {}
            }
        }
    }
    Ok(())
}

async fn cmd_users(
    app: &App,
    action: UserAction,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    match action {
        UserAction::Add {
            email,
            role,
            skills,
        } => {
            let role = parse_role(&role)?;
            let user = app
                .services
                .users
                .create(&NewUser::new(email, role).with_skills(skills))
                .await?;

            let results = app
                .dispatch(TriageEvent::UserSignup(UserSignup {
                    email: user.email.clone(),
                }))
                .await?;

            match format {
                OutputFormat::Json => print_json(&user)?,
                OutputFormat::Text if !quiet => {
                    println!("User created: {} ({})", user.email, user.role);
                    println!("  ID: {}", user.id);
                    if !user.skills.is_empty() {
                        println!("  Skills: {}", user.skills.join(", "));
                    }
                    print_runs(&results);
                }
                OutputFormat::Text => println!("{}", user.id),
            }
        }
        UserAction::Update {
            email,
            role,
            skills,
        } => {
            if role.is_none() && skills.is_none() {
                anyhow::bail!("Nothing to update. Pass --role and/or --skills.");
            }
            let role = role.as_deref().map(parse_role).transpose()?;
            let user = app.services.users.update_user(&email, role, skills).await?;

            match format {
                OutputFormat::Json => print_json(&user)?,
                OutputFormat::Text if !quiet => {
                    println!("User updated: {} ({})", user.email, user.role);
                    if !user.skills.is_empty() {
                        println!("  Skills: {}", user.skills.join(", "));
                    }
                }
                OutputFormat::Text => println!("{}", user.id),
            }
        }
        UserAction::List => {
            let users = app.services.users.list().await?;
            if format == OutputFormat::Json {
                return print_json(&users);
            }
            if users.is_empty() {
                if !quiet {
                    println!("No users found.");
                    println!("\nAdd one with: triage users add <email> --role moderator --skills React,CSS");
                }
            } else {
                if !quiet {
                    println!("Users:");
                }
                for u in users {
                    println!("  {} - {} [{}] {}", short_id(&u.id), u.email, u.role, u.skills.join(", "));
                }
            }
        }
    }
    Ok(())
}

async fn cmd_runs(app: &App, action: RunAction, format: OutputFormat) -> anyhow::Result<()> {
    let journal = app.engine.journal();
    match action {
        RunAction::List { limit } => {
            let runs = journal.list_runs(limit).await?;
            if format == OutputFormat::Json {
                return print_json(&runs);
            }
            if runs.is_empty() {
                println!("No runs recorded.");
            }
            for r in runs {
                println!(
                    "  {} {} (attempts: {}, updated {})",
                    r.id,
                    r.status,
                    r.attempts,
                    r.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        RunAction::Show { id } => {
            let run = journal.get_run(&id).await?.ok_or_else(|| {
                anyhow::anyhow!("Run '{}' not found. Run `triage runs list` to see all runs.", id)
            })?;
            let steps = journal.steps(&id).await?;

            if format == OutputFormat::Json {
                return print_json(&serde_json::json!({ "run": run, "steps": steps }));
            }

            println!("Run: {}", run.id);
            println!("  Function: {}", run.function_id);
            println!("  Event: {} ({})", run.event_name, run.event_id);
            println!("  Status: {}", run.status);
            println!("  Attempts: {}", run.attempts);
            if let Some(error) = &run.last_error {
                println!("  Last error: {}", error);
            }
            if let Some(output) = &run.output {
                println!("  Output: {}", output);
            }
            println!("  Steps:");
            for s in steps {
                println!("    {} (attempt {}): {}", s.name, s.attempt, s.output);
            }
        }
    }
    Ok(())
}

async fn cmd_similar(
    app: &App,
    text: &str,
    k: usize,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let vector = app.services.embeddings.embed(text).await?;
    let similar = app.services.index.query(&vector, k).await;

    if format == OutputFormat::Json {
        return print_json(&similar);
    }
    if similar.is_empty() {
        if !quiet {
            println!("No similar resolved tickets.");
        }
        return Ok(());
    }
    for (i, s) in similar.iter().enumerate() {
        println!("{}. {} ({:.2})", i + 1, s.title, s.score);
        println!("   {}", s.resolution);
    }
    Ok(())
}

async fn cmd_graph(app: &App, action: GraphAction, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        GraphAction::Stats => {
            let stats = app.services.graph.stats().await?;
            match format {
                OutputFormat::Json => print_json(&stats)?,
                OutputFormat::Text => {
                    println!("Knowledge graph:");
                    println!("  Tickets: {}", stats.ticket_nodes);
                    println!("  Skills: {}", stats.skill_nodes);
                    println!("  REQUIRES edges: {}", stats.requires_edges);
                    println!("  Vector indexes: {}", stats.vector_indexes);
                }
            }
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_doctor(quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!("Triage Health Check");
        println!("===================");
        println!();
    }

    let mut all_ok = true;

    match Config::load() {
        Ok(config) => {
            match config.validate() {
                Ok(()) => {
                    if !quiet {
                        println!("[OK] Configuration: Valid");
                    }
                }
                Err(e) => {
                    all_ok = false;
                    if !quiet {
                        println!("[!!] Configuration: Invalid - {}", e);
                    }
                }
            }

            match config.llm.resolved_api_key() {
                Ok(Some(_)) => {
                    if !quiet {
                        let redacted = config.llm.redacted_api_key()?.unwrap_or_default();
                        println!("[OK] API Key: Configured ({})", redacted);
                    }
                }
                Ok(None) => {
                    all_ok = false;
                    if !quiet {
                        println!("[!!] API Key: Not configured");
                        println!("     Set TRIAGE_API_KEY or OPENROUTER_API_KEY environment variable");
                    }
                }
                Err(e) => {
                    all_ok = false;
                    if !quiet {
                        println!("[!!] API Key: Error - {}", e);
                    }
                }
            }
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Configuration: Error - {}", e);
            }
        }
    }

    if !quiet {
        match Config::config_path() {
            Ok(path) => {
                if path.exists() {
                    println!("[OK] Config file: {}", path.display());
                } else {
                    println!("[--] Config file: {} (using defaults)", path.display());
                }
            }
            Err(e) => {
                println!("[!!] Config file: Error - {}", e);
            }
        }
    }

    match Database::default().await {
        Ok(db) => {
            match db.health_check().await {
                Ok(()) => {
                    if !quiet {
                        println!("[OK] Database: Connected");
                        println!("     Path: {}", db.path().display());
                    }
                    match db.migration_status().await {
                        Ok(status) if status.needs_migration => {
                            all_ok = false;
                            if !quiet {
                                println!(
                                    "[!!] Database: Migrations pending (v{} -> v{})",
                                    status.current_version, status.target_version
                                );
                            }
                        }
                        Ok(status) => {
                            if !quiet {
                                println!("[OK] Database: Schema v{}", status.current_version);
                            }
                        }
                        Err(e) => {
                            all_ok = false;
                            if !quiet {
                                println!("[!!] Database: Migration check failed - {}", e);
                            }
                        }
                    }
                }
                Err(e) => {
                    all_ok = false;
                    if !quiet {
                        println!("[!!] Database: Health check failed - {}", e);
                    }
                }
            }
            db.close().await;
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Database: Failed to initialize - {}", e);
            }
        }
    }

    if !quiet {
        println!();
        if all_ok {
            println!("All checks passed!");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }

    Ok(())
}
