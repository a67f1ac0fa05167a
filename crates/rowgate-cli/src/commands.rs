//! Subcommand implementations.
//!
//! Each command builds a policy store from the configured sources, runs
//! against it and returns the formatted output.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rowgate_core::{
    AccessGate, CatalogError, ClaimsContext, Command, ConfigurationError, DecisionTrace,
    DeniedError, EngineConfig, EnforcementMode, LockoutWarning, Policy, PolicyBundle,
    PolicyCatalog, PolicyStore, Pushdown, Row, WriteCommand,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info, warn};

use crate::formatter::{create_formatter, OutputFormat};

/// Errors raised by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("no policy source: pass --policies or --catalog")]
    NoPolicySource,

    #[error("{0} is required for this command")]
    MissingArgument(&'static str),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("--existing only applies to update")]
    UnexpectedExisting,

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("cannot open catalog: {0}")]
    Storage(#[from] sled::Error),

    #[error(transparent)]
    Denied(#[from] DeniedError),
}

impl CliError {
    /// Render for the terminal. Expression errors point at the offending
    /// source with a caret.
    pub fn render(&self) -> String {
        let config = match self {
            CliError::Configuration(e) | CliError::Catalog(CatalogError::Configuration(e)) => e,
            other => return other.to_string(),
        };
        match config {
            ConfigurationError::InvalidExpression {
                policy,
                clause,
                expression,
                source,
            } => format!(
                "policy '{}' has an invalid {} expression\n{}",
                policy,
                clause,
                source.format_with_source(expression)
            ),
            other => other.to_string(),
        }
    }
}

/// Where policies and engine settings come from.
#[derive(Debug, Clone, Default)]
pub struct Sources {
    config: Option<PathBuf>,
    policies: Option<PathBuf>,
    catalog: Option<PathBuf>,
}

impl Sources {
    pub fn new(config: Option<PathBuf>, policies: Option<PathBuf>, catalog: Option<PathBuf>) -> Self {
        Self {
            config,
            policies,
            catalog,
        }
    }

    fn engine_config(&self) -> Result<EngineConfig, CliError> {
        match &self.config {
            Some(path) => Ok(EngineConfig::from_json_file(path)?),
            None => Ok(EngineConfig::default()),
        }
    }

    /// Build a store from the catalog, then the bundle file on top.
    pub fn load_store(&self) -> Result<Arc<PolicyStore>, CliError> {
        if self.policies.is_none() && self.catalog.is_none() {
            return Err(CliError::NoPolicySource);
        }
        let store = Arc::new(PolicyStore::with_config(self.engine_config()?));

        if let Some(dir) = &self.catalog {
            let db = sled::open(dir)?;
            let loaded = PolicyCatalog::open(&db)?.load_into(&store)?;
            info!(catalog = %dir.display(), policies = loaded, "Loaded policy catalog");
        }
        if let Some(path) = &self.policies {
            let bundle: PolicyBundle = read_json(path)?;
            store.load_bundle(bundle)?;
        }
        Ok(store)
    }
}

/// Summary of a registered policy set.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub policies: usize,
    pub collections: usize,
    pub version: u64,
    pub lockouts: Vec<LockoutWarning>,
}

/// Everything `explain` reports for one request.
#[derive(Debug, Clone)]
pub struct Explanation {
    pub collection: String,
    pub command: Command,
    pub role: String,
    pub mode: EnforcementMode,
    pub enforced: bool,
    pub policies: Vec<Arc<Policy>>,
    pub pushdown: Pushdown,
    pub traces: Vec<DecisionTrace>,
}

/// Register every policy and report lockouts.
pub fn validate(sources: &Sources, format: OutputFormat) -> Result<String, CliError> {
    let store = sources.load_store()?;
    let snapshot = store.snapshot();
    let lockouts = store.lockouts();
    for lockout in &lockouts {
        warn!("{}", lockout);
    }

    let report = ValidationReport {
        policies: snapshot.len(),
        collections: snapshot.collections().len(),
        version: snapshot.version(),
        lockouts,
    };
    Ok(create_formatter(format).format_validation(&report))
}

/// Print the candidate rows the principal may read.
pub fn read(
    sources: &Sources,
    collection: &str,
    context: &Path,
    rows: &Path,
    format: OutputFormat,
) -> Result<String, CliError> {
    let gate = AccessGate::new(sources.load_store()?);
    let ctx: ClaimsContext = read_json(context)?;
    let rows: Vec<Row> = read_json(rows)?;

    let visible = gate.filter_read(collection, &ctx, rows);
    Ok(create_formatter(format).format_rows(&visible))
}

/// Authorize a single write.
pub fn write(
    sources: &Sources,
    collection: &str,
    command: WriteCommand,
    context: &Path,
    row: &Path,
    existing: Option<&Path>,
    format: OutputFormat,
) -> Result<String, CliError> {
    let gate = AccessGate::new(sources.load_store()?);
    let ctx: ClaimsContext = read_json(context)?;
    let row: Row = read_json(row)?;

    match (command, existing) {
        (WriteCommand::Update, Some(existing)) => {
            let existing: Row = read_json(existing)?;
            gate.authorize_update(collection, &ctx, &existing, &row)?;
        }
        (_, Some(_)) => return Err(CliError::UnexpectedExisting),
        (_, None) => gate.authorize_write(collection, &ctx, command, &row)?,
    }

    Ok(create_formatter(format).format_message(&format!(
        "{} on '{}' allowed",
        command, collection
    )))
}

/// Explain how policies apply to a request.
pub fn explain(
    sources: &Sources,
    collection: &str,
    command: Command,
    context: &Path,
    row: Option<&Path>,
    format: OutputFormat,
) -> Result<String, CliError> {
    let gate = AccessGate::new(sources.load_store()?);
    let ctx: ClaimsContext = read_json(context)?;
    let engine = gate.engine();

    let traces = match row {
        Some(path) => {
            let row: Row = read_json(path)?;
            command
                .phases()
                .iter()
                .map(|phase| engine.trace(collection, command, *phase, &ctx, &row))
                .collect()
        }
        None => Vec::new(),
    };

    let explanation = Explanation {
        collection: collection.to_string(),
        command,
        role: ctx.role().to_string(),
        mode: gate.store().mode(collection),
        enforced: gate.is_enforced(collection, &ctx),
        policies: gate.store().policies_for(collection, command, ctx.role()),
        pushdown: engine.pushdown(collection, command, &ctx),
        traces,
    };
    Ok(create_formatter(format).format_explanation(&explanation))
}

/// Persist the bundle file into the catalog.
pub fn import(sources: &Sources, format: OutputFormat) -> Result<String, CliError> {
    let dir = sources
        .catalog
        .as_deref()
        .ok_or(CliError::MissingArgument("--catalog"))?;
    let path = sources
        .policies
        .as_deref()
        .ok_or(CliError::MissingArgument("--policies"))?;

    let bundle: PolicyBundle = read_json(path)?;
    let db = sled::open(dir)?;
    let catalog = PolicyCatalog::open(&db)?;
    let count = catalog.import(&bundle)?;
    catalog.flush()?;

    Ok(create_formatter(format).format_message(&format!(
        "imported {} policies into {}",
        count,
        dir.display()
    )))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CliError::Json {
        path: path.to_path_buf(),
        source,
    })
}
