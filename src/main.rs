//! Corral CLI entrypoint.
//!
//! This is the main entrypoint for the corral command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use corral::allocator::{extract_constraints_from_env, extract_constraints_from_labels, AllocatorService};
use corral::cli::{parse_env_args, parse_label_args, Cli, Commands, OutputFormatter, ServiceReport};
use corral::config::{find_config_file, ConfigParser, ConfigValidator, Inventory};
use corral::deployment::DeploymentManager;
use corral::error::{ConfigError, CorralError, Result};
use corral::runtime::{ConfigUpdate, DryRunAgent, InMemoryConfigItems, InlineProcessScheduler, MemoryEventBus};
use corral::state::{ExposeMapDao, MemoryStore, ObjectStore, Service};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. Logs go to stderr so stdout only carries
/// command output.
fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings, &formatter),
        Commands::Constraints { labels, env } => cmd_constraints(&labels, &env, &formatter),
        Commands::Hosts { account, labels } => {
            let session = Session::open(cli.config.as_ref(), cli.state.as_ref()).await?;
            cmd_hosts(&session, account, &labels, &formatter).await
        }
        Commands::Reconcile { service } => {
            let session = Session::open(cli.config.as_ref(), cli.state.as_ref()).await?;
            cmd_reconcile(&session, service.as_deref(), &formatter).await
        }
        Commands::Status => {
            let session = Session::open(cli.config.as_ref(), cli.state.as_ref()).await?;
            cmd_status(&session, &formatter).await
        }
    }
}

/// Validate the inventory.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool, formatter: &OutputFormatter) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating inventory: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;
    let inventory = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&inventory);
    emit(&formatter.format_validation(&inventory, &result, show_warnings))?;

    if result.is_valid() {
        Ok(())
    } else {
        Err(ConfigError::validation_general(format!("{} validation error(s)", result.error_count())).into())
    }
}

/// Print extracted constraints.
fn cmd_constraints(labels: &[String], env: &[String], formatter: &OutputFormatter) -> Result<()> {
    let labels = parse_label_args(labels)?;
    let env = parse_env_args(env);

    let mut constraints = extract_constraints_from_labels(&labels, None);
    constraints.extend(extract_constraints_from_env(&env));
    debug!("Extracted {} constraint(s)", constraints.len());

    emit(&formatter.format_constraints(&constraints))
}

/// List hosts satisfying host affinity.
async fn cmd_hosts(session: &Session, account_id: i64, labels: &[String], formatter: &OutputFormatter) -> Result<()> {
    let labels = parse_label_args(labels)?;
    let allocator = AllocatorService::new(session.store());

    let mut hosts = Vec::new();
    for id in allocator.get_hosts_satisfying_host_affinity(account_id, &labels).await? {
        hosts.push(session.store.get_host(id).await?);
    }

    emit(&formatter.format_hosts(account_id, &hosts))
}

/// Reconcile services and save the snapshot.
async fn cmd_reconcile(session: &Session, service_name: Option<&str>, formatter: &OutputFormatter) -> Result<()> {
    let (manager, updates) = session.manager();

    let services = session.store.list_services().await?;
    let targets: Vec<Service> = match service_name {
        Some(name) => {
            let service = services
                .into_iter()
                .find(|s| s.name == name && s.removed.is_none())
                .ok_or_else(|| ConfigError::validation(format!("Unknown service: {name}"), "service"))?;
            vec![service]
        }
        None => services.into_iter().filter(Service::is_active_eligible).collect(),
    };

    if targets.is_empty() {
        warn!("No active services to reconcile");
    } else {
        info!("Reconciling {} service(s)", targets.len());
    }

    manager.reconcile_services(&targets).await?;
    let outcome = converge(&manager, updates, &targets).await;

    // Save whatever was done, even if a service did not converge
    session.save().await?;
    outcome?;

    let reports = session.reports(&manager).await?;
    emit(&formatter.format_services(&reports))
}

/// Show per-service convergence.
async fn cmd_status(session: &Session, formatter: &OutputFormatter) -> Result<()> {
    let (manager, _updates) = session.manager();
    let reports = session.reports(&manager).await?;
    emit(&formatter.format_services(&reports))
}

/// Handles reconcile updates until every target has applied its latest
/// request.
async fn converge(
    manager: &DeploymentManager,
    updates: mpsc::UnboundedReceiver<ConfigUpdate>,
    targets: &[Service],
) -> Result<()> {
    let wait_all = async {
        for service in targets {
            manager.wait_for_reconcile(service).await?;
            debug!("Service {} converged", service.name);
        }
        Ok(())
    };

    tokio::select! {
        () = manager.run_updates(updates) => Err(CorralError::internal("Config update channel closed")),
        result = wait_all => result,
    }
}

// ============================================================================
// Session
// ============================================================================

/// Inventory plus the state store a command runs against.
struct Session {
    inventory: Inventory,
    state_path: PathBuf,
    store: Arc<MemoryStore>,
}

impl Session {
    /// Loads the inventory and the saved snapshot, then applies the
    /// inventory's desired services and hosts to the store.
    async fn open(config_path: Option<&PathBuf>, state_path: Option<&PathBuf>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        debug!("Loading inventory from: {}", config_file.display());

        let base = base_dir(&config_file);
        let parser = ConfigParser::new().with_base_path(base);
        parser.load_dotenv()?;

        let inventory = parser.load_with_env(&config_file)?;
        ConfigValidator::new().validate(&inventory)?;

        let state_path = state_path.cloned().unwrap_or_else(|| base.join(".corral").join("state.json"));
        let session = match MemoryStore::load_snapshot(&state_path).await? {
            Some(store) => Self {
                inventory,
                state_path,
                store: Arc::new(store),
            },
            None => {
                let session = Self {
                    inventory,
                    state_path,
                    store: Arc::new(MemoryStore::new()),
                };
                session.seed_instances().await?;
                session
            }
        };
        session.sync_inventory().await?;
        Ok(session)
    }

    fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store) as Arc<dyn ObjectStore>
    }

    /// Creates or updates hosts and services from the inventory. Lifecycle
    /// state already in the store wins over the inventory's.
    async fn sync_inventory(&self) -> Result<()> {
        for host in &self.inventory.hosts {
            match self.store.get_host(host.id).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    self.store.create_host(host.clone()).await?;
                }
                Err(e) => return Err(e),
            }
        }

        for desired in &self.inventory.services {
            match self.store.get_service(desired.id).await {
                Ok(current) => {
                    let mut service = desired.clone();
                    service.state = current.state;
                    service.removed = current.removed;
                    self.store.update_service(&service).await?;
                }
                Err(e) if e.is_not_found() => {
                    self.store.create_service(desired.clone()).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stores the inventory's pre-existing instances, binding them to their
    /// services.
    async fn seed_instances(&self) -> Result<()> {
        let dao = ExposeMapDao::new(self.store());
        for spec in &self.inventory.instances {
            let service = spec
                .service_id
                .and_then(|id| self.inventory.services.iter().find(|s| s.id == id));
            match service {
                Some(service) => {
                    dao.create_service_instance(service, spec.instance.clone()).await?;
                }
                None => {
                    self.store.create_instance(spec.instance.clone()).await?;
                }
            }
        }
        info!("Seeded {} instance(s) from the inventory", self.inventory.instances.len());
        Ok(())
    }

    /// A manager over the session's store, with dry-run collaborators.
    fn manager(&self) -> (DeploymentManager, mpsc::UnboundedReceiver<ConfigUpdate>) {
        let store = self.store();
        let (items, updates) = InMemoryConfigItems::new(&self.inventory.manager);
        let manager = DeploymentManager::new(
            Arc::clone(&store),
            Arc::new(DryRunAgent::new()),
            Arc::new(InlineProcessScheduler::new(store)),
            Arc::new(items),
            Arc::new(MemoryEventBus::new()),
            self.inventory.manager.clone(),
        );
        (manager, updates)
    }

    async fn reports(&self, manager: &DeploymentManager) -> Result<Vec<ServiceReport>> {
        let dao = ExposeMapDao::new(self.store());
        let mut reports = Vec::new();
        for service in self.store.list_services().await? {
            if service.removed.is_some() {
                continue;
            }
            let running = dao
                .list_service_instances(service.id)
                .await?
                .iter()
                .filter(|i| i.is_running())
                .count();
            let healthy = manager.is_healthy(&service).await?;
            reports.push(ServiceReport::new(&service, running, healthy));
        }
        Ok(reports)
    }

    async fn save(&self) -> Result<()> {
        self.store.save_snapshot(&self.state_path).await
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the inventory file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(path.clone()),
        None => find_config_file(std::env::current_dir()?),
    }
}

/// Directory holding the inventory file.
fn base_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Writes command output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(())
}
