//! # Permission Check CLI
//!
//! Evaluates one permission request against a JSON snapshot of entities,
//! resources and policies.
//!
//! ## Usage
//!
//! ```text
//! permit-check [--compounder <KIND>] <SNAPSHOT> <REQUEST>
//! ```
//!
//! The request file holds `{ "requester", "access", "resource", "compounder"? }`
//! where `resource` is a resource id or a full resource document and
//! `compounder` is `deny-overrides` (default) or `first-applicable`. The
//! `--compounder` flag overrides the request file.
//!
//! Prints `allow` or `deny`. Exit status is 0 for allow, 1 for deny, 2 when no
//! policy reached a decision and 64 for invalid arguments.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `RUST_LOG` - Log level (default: info)
//! - `IPERMIT_CACHE_ENABLED`, `IPERMIT_CACHE_MAX_LENGTH`, `IPERMIT_CACHE_EVICT_BATCH` - memoization

use anyhow::Context;
use clap::Parser;
use ipermit_authz::{
    Access, AuthzError, CheckPermRequest, CompounderKind, DataProvider, EntityId, InMemoryStore, PermitConfig, PermitEngine,
    ResourceRef, Snapshot,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit status for invalid arguments (sysexits EX_USAGE)
const EXIT_USAGE: u8 = 64;

#[derive(Parser)]
#[command(name = "permit-check", about = "Evaluate a permission request against a policy snapshot")]
#[command(version)]
struct Cli {
    /// JSON snapshot of entities, resources and policies
    snapshot: PathBuf,

    /// JSON permission request
    request: PathBuf,

    /// Compounder to use instead of the one named in the request
    #[arg(short, long)]
    compounder: Option<CompounderKind>,
}

/// Request file contents
#[derive(Debug, Deserialize)]
struct RequestFile {
    requester: EntityId,
    access: Access,
    resource: ResourceRef,
    #[serde(default)]
    compounder: CompounderKind,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // clap's own failure status (2) would read as "no decision"
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            e.print()?;
            return Ok(if e.use_stderr() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            });
        }
    };

    info!("permit-check v{}", ipermit_authz::VERSION);

    let config = PermitConfig::from_env().context("invalid IPERMIT_* configuration")?;
    if config.data_provider != DataProvider::Memory {
        warn!("Ignoring configured data provider; checks run against the snapshot");
    }

    let snapshot = Snapshot::from_json_file(&cli.snapshot)
        .with_context(|| format!("failed to load snapshot {}", cli.snapshot.display()))?;
    info!(
        "Loaded snapshot: {} entities, {} resources, {} policies",
        snapshot.entities.len(),
        snapshot.resources.len(),
        snapshot.policies.len()
    );

    let raw = std::fs::read_to_string(&cli.request)
        .with_context(|| format!("failed to read {}", cli.request.display()))?;
    let request: RequestFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse request {}", cli.request.display()))?;

    let compounder = cli.compounder.unwrap_or(request.compounder);
    info!(
        "Checking {:?} for {} on {} ({} compounder)",
        request.access.as_slice(),
        request.requester,
        request.resource.id(),
        compounder
    );

    let engine = PermitEngine::with_config(Arc::new(InMemoryStore::from_snapshot(snapshot)), config);
    let check = CheckPermRequest::new(request.requester, request.access, request.resource);

    match engine.check_perm_with(check, compounder.compounder()).await {
        Ok(true) => {
            println!("allow");
            Ok(ExitCode::SUCCESS)
        }
        Ok(false) => {
            println!("deny");
            Ok(ExitCode::from(1))
        }
        Err(AuthzError::NoDecision) => {
            eprintln!("no policy reached a decision ({} compounder)", compounder);
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e).context("permission check failed"),
    }
}
