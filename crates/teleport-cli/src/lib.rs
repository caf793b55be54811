//! CLI commands for Teleport
//!
//! `tport` drives the export and import engines against a SQLite host
//! database. Every command prints JSON on stdout; `run` commands poll
//! `advance` until the job leaves the running state.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use teleport_core::{AllowAll, Config, TELEPORT_VERSION, Version};
use teleport_db::SqliteDatabase;
use teleport_engine::{EngineError, ExportEngine, FileJobStore, ImportEngine, JobStatusView};
use teleport_package::{
    PackageError, PackageReader, SignatureCheck, generate_signing_key, validate_compatibility,
    verify_chunk, verify_manifest_signature,
};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("exit code {0}")]
    ExitCode(i32),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error(transparent)]
    Core(#[from] teleport_core::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(name = "tport", version, about = "Teleport export/import CLI")]
pub struct Cli {
    /// SQLite database of the host application.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Log at debug level unless `RUST_LOG` is set.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Kind {
    Export,
    Import,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a package from a directory tree and the host database.
    Export {
        #[command(subcommand)]
        action: ExportCommand,
    },
    /// Apply a package to a target tree and the host database.
    Import {
        #[command(subcommand)]
        action: ImportCommand,
    },
    /// Show one job.
    Status { kind: Kind, id: String },
    /// List retained jobs, newest first.
    Jobs {
        #[arg(long, value_enum)]
        kind: Option<Kind>,
    },
    /// Write the technical report of a job.
    Report {
        kind: Kind,
        id: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Check every digest and the signature of a package without importing.
    Verify {
        archive: PathBuf,
        #[arg(long)]
        trusted_key: Option<String>,
    },
    /// Print the header and a manifest summary of a package.
    Inspect { archive: PathBuf },
    /// Generate an Ed25519 signing key and print its public half.
    Keygen { path: PathBuf },
}

#[derive(Subcommand, Debug)]
pub enum ExportCommand {
    Start {
        base: PathBuf,
        /// Subdirectories of `base` to include (all of `base` when omitted).
        #[arg(long = "root")]
        roots: Vec<PathBuf>,
    },
    Continue { id: String },
    /// Start and drive to completion.
    Run {
        base: PathBuf,
        #[arg(long = "root")]
        roots: Vec<PathBuf>,
    },
    Pause { id: String },
    Resume { id: String },
    Cancel { id: String },
}

#[derive(Subcommand, Debug)]
pub enum ImportCommand {
    Start {
        archive: PathBuf,
        target: PathBuf,
        #[arg(long)]
        trusted_key: Option<String>,
    },
    Continue {
        id: String,
        #[arg(long)]
        trusted_key: Option<String>,
    },
    /// Start and drive to completion.
    Run {
        archive: PathBuf,
        target: PathBuf,
        #[arg(long)]
        trusted_key: Option<String>,
    },
    Pause { id: String },
    Resume { id: String },
    Cancel { id: String },
    /// Retry a rollback, or revert a completed import.
    Rollback { id: String },
    DiscardBackups { id: String },
}

pub fn run() -> i32 {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match execute(cli) {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            err_exit_code(&err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

const fn err_exit_code(err: &CliError) -> i32 {
    match err {
        CliError::ExitCode(code) => *code,
        CliError::InvalidArgument(_) => 2,
        _ => 1,
    }
}

fn emit_error(err: &CliError) {
    if matches!(err, CliError::ExitCode(_)) {
        return;
    }
    match err {
        CliError::Engine(engine) => eprintln!("error [{}]: {engine}", engine.code()),
        CliError::Package(package) => eprintln!("error [{}]: {package}", package.code()),
        other => eprintln!("error: {other}"),
    }
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Non-zero exit for a job that ended anywhere but `completed`.
fn finish(view: &JobStatusView) -> CliResult<()> {
    print_json(view)?;
    match view.status {
        teleport_engine::JobStatus::Completed => Ok(()),
        _ => Err(CliError::ExitCode(3)),
    }
}

struct Host {
    config: Config,
    db: SqliteDatabase,
    store: FileJobStore,
}

impl Host {
    fn open(db: Option<&Path>) -> CliResult<Self> {
        let config = Config::from_env();
        let db_path = db.ok_or_else(|| CliError::InvalidArgument("--db is required".into()))?;
        let db = SqliteDatabase::open(db_path)?;
        let store = FileJobStore::new(config.jobs_dir());
        tracing::debug!(data_dir = %config.data_dir.display(), "[cli] host opened");
        Ok(Self { config, db, store })
    }

    fn exporter(&self) -> ExportEngine<'_> {
        ExportEngine::new(&self.config, &self.db, &self.store, &AllowAll)
    }

    fn importer(&self, trusted_key: Option<String>) -> ImportEngine<'_> {
        let engine = ImportEngine::new(&self.config, &self.db, &self.store, &AllowAll);
        match trusted_key {
            Some(key) => engine.with_trusted_key(key),
            None => engine,
        }
    }
}

fn execute(cli: Cli) -> CliResult<()> {
    match cli.command {
        Commands::Export { action } => handle_export(cli.db.as_deref(), action),
        Commands::Import { action } => handle_import(cli.db.as_deref(), action),
        Commands::Status { kind, id } => {
            let host = Host::open(cli.db.as_deref())?;
            let view = match kind {
                Kind::Export => host.exporter().status(&id)?,
                Kind::Import => host.importer(None).status(&id)?,
            };
            print_json(&view)
        }
        Commands::Jobs { kind } => {
            let host = Host::open(cli.db.as_deref())?;
            let mut views = Vec::new();
            if kind.is_none_or(|k| k == Kind::Export) {
                views.extend(host.exporter().list()?);
            }
            if kind.is_none_or(|k| k == Kind::Import) {
                views.extend(host.importer(None).list()?);
            }
            views.sort_by(|a, b| b.timestamps.created_at.cmp(&a.timestamps.created_at));
            print_json(&views)
        }
        Commands::Report { kind, id, out } => {
            let host = Host::open(cli.db.as_deref())?;
            let report = match kind {
                Kind::Export => host.exporter().report(&id)?,
                Kind::Import => host.importer(None).report(&id)?,
            };
            match out {
                Some(path) => {
                    let bytes = serde_json::to_vec_pretty(&report)?;
                    teleport_core::paths::write_file_atomic(&path, &bytes)?;
                    eprintln!("report written to {}", path.display());
                    Ok(())
                }
                None => print_json(&report),
            }
        }
        Commands::Verify {
            archive,
            trusted_key,
        } => verify(&archive, trusted_key.as_deref()),
        Commands::Inspect { archive } => inspect(&archive),
        Commands::Keygen { path } => {
            let public_key = generate_signing_key(&path)?;
            print_json(&serde_json::json!({
                "secret_key_path": path.display().to_string(),
                "public_key": public_key,
            }))
        }
    }
}

fn drive_export(engine: &ExportEngine<'_>, mut view: JobStatusView) -> CliResult<JobStatusView> {
    while view.needs_advance() {
        view = engine.advance(&view.id)?;
        tracing::info!(id = %view.id, phase = %view.phase, progress = view.progress, "[cli] export");
    }
    Ok(view)
}

fn drive_import(engine: &ImportEngine<'_>, mut view: JobStatusView) -> CliResult<JobStatusView> {
    while view.needs_advance() {
        view = engine.advance(&view.id)?;
        tracing::info!(id = %view.id, phase = %view.phase, progress = view.progress, "[cli] import");
    }
    Ok(view)
}

fn handle_export(db: Option<&Path>, action: ExportCommand) -> CliResult<()> {
    let host = Host::open(db)?;
    let engine = host.exporter();
    match action {
        ExportCommand::Start { base, roots } => print_json(&engine.start(&base, &roots)?),
        ExportCommand::Continue { id } => print_json(&engine.advance(&id)?),
        ExportCommand::Run { base, roots } => {
            let view = engine.start(&base, &roots)?;
            finish(&drive_export(&engine, view)?)
        }
        ExportCommand::Pause { id } => print_json(&engine.pause(&id)?),
        ExportCommand::Resume { id } => print_json(&engine.resume(&id)?),
        ExportCommand::Cancel { id } => print_json(&engine.cancel(&id)?),
    }
}

fn handle_import(db: Option<&Path>, action: ImportCommand) -> CliResult<()> {
    let host = Host::open(db)?;
    match action {
        ImportCommand::Start {
            archive,
            target,
            trusted_key,
        } => print_json(&host.importer(trusted_key).start(&archive, &target)?),
        ImportCommand::Continue { id, trusted_key } => {
            print_json(&host.importer(trusted_key).advance(&id)?)
        }
        ImportCommand::Run {
            archive,
            target,
            trusted_key,
        } => {
            let engine = host.importer(trusted_key);
            let view = engine.start(&archive, &target)?;
            finish(&drive_import(&engine, view)?)
        }
        ImportCommand::Pause { id } => print_json(&host.importer(None).pause(&id)?),
        ImportCommand::Resume { id } => print_json(&host.importer(None).resume(&id)?),
        ImportCommand::Cancel { id } => print_json(&host.importer(None).cancel(&id)?),
        ImportCommand::Rollback { id } => print_json(&host.importer(None).rollback(&id)?),
        ImportCommand::DiscardBackups { id } => {
            print_json(&host.importer(None).discard_backups(&id)?)
        }
    }
}

#[derive(Debug, Serialize)]
struct VerifyReport {
    archive: String,
    chunks: usize,
    global_hash: String,
    signed_by: Option<String>,
    compatible: bool,
    compatibility_error: Option<String>,
}

fn verify(archive: &Path, trusted_key: Option<&str>) -> CliResult<()> {
    let mut reader = PackageReader::open(archive)?;
    reader.read_header()?;
    let manifest = reader.read_manifest()?;
    for chunk in &manifest.chunks {
        verify_chunk(&mut reader, chunk)?;
    }
    let actual = manifest.compute_global_checksum();
    if !actual.eq_ignore_ascii_case(&manifest.integrity.global_hash) {
        return Err(PackageError::GlobalChecksumMismatch {
            expected: manifest.integrity.global_hash.clone(),
            actual,
        }
        .into());
    }
    let signed_by = match verify_manifest_signature(&manifest, trusted_key)? {
        SignatureCheck::Verified { public_key } => Some(public_key),
        SignatureCheck::Unsigned if trusted_key.is_some() => {
            return Err(PackageError::Signature {
                message: "package is unsigned but a trusted key was given".into(),
            }
            .into());
        }
        SignatureCheck::Unsigned => None,
    };
    let importer: Version = TELEPORT_VERSION
        .parse()
        .map_err(|e| CliError::InvalidArgument(format!("build version: {e}")))?;
    let compatibility = validate_compatibility(&manifest, &importer);
    print_json(&VerifyReport {
        archive: archive.display().to_string(),
        chunks: manifest.chunks.len(),
        global_hash: manifest.integrity.global_hash.clone(),
        signed_by,
        compatible: compatibility.is_ok(),
        compatibility_error: compatibility.err().map(|e| e.to_string()),
    })
}

fn inspect(archive: &Path) -> CliResult<()> {
    let mut reader = PackageReader::open(archive)?;
    let header = reader.read_header()?;
    let manifest = reader.read_manifest()?;
    print_json(&serde_json::json!({
        "header": header,
        "format_version": manifest.format_version,
        "exporter_version": manifest.exporter_version,
        "compatibility": manifest.compatibility,
        "environment": manifest.environment,
        "tables": manifest.tables,
        "totals": manifest.totals,
        "filesystem_chunks": manifest.filesystem_chunks().len(),
        "database_chunks": manifest.database_chunks().len(),
        "files": manifest.file_paths(),
        "global_hash": manifest.integrity.global_hash,
        "signed": manifest.signature.enabled,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_import_run() {
        let cli = Cli::try_parse_from([
            "tport", "--db", "host.db", "import", "run", "pkg.zip", "/srv/site",
        ])
        .unwrap();
        assert_eq!(cli.db.as_deref(), Some(Path::new("host.db")));
        assert!(matches!(
            cli.command,
            Commands::Import {
                action: ImportCommand::Run { .. }
            }
        ));
    }

    #[test]
    fn parses_repeated_roots() {
        let cli = Cli::try_parse_from([
            "tport", "export", "start", "/srv", "--root", "uploads", "--root", "themes",
        ])
        .unwrap();
        match cli.command {
            Commands::Export {
                action: ExportCommand::Start { roots, .. },
            } => assert_eq!(roots, vec![PathBuf::from("uploads"), PathBuf::from("themes")]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_db_is_an_argument_error() {
        let err = Host::open(None).err().unwrap();
        assert_eq!(err_exit_code(&err), 2);
    }
}
