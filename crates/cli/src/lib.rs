use anyhow::{Context as AnyhowContext, Result};
use atomstore_ingest::{AtomstoreConfig, IngestionPipeline, StoreDir};
use atomstore_protocol::{
    AtomView, DedupStatsView, DeleteResult, ErrorCode, FileAtomsResponse, GcResult,
    SearchResponse, UploadResult, VerifyResult,
};
use atomstore_store::FileId;
use clap::{Args, Parser, Subcommand};
use command::{
    classify_error, CommandAction, CommandHandler, CommandRequest, CommandResponse,
    ResponseMeta,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub mod command;

#[derive(Parser)]
#[command(name = "atomstore")]
#[command(about = "Content-addressable atom store with deduplication accounting", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Store directory
    #[arg(long, global = true, default_value = ".atomstore")]
    store: PathBuf,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a JSON command API request
    Command(CommandArgs),

    /// Ingest files into the store
    Ingest(IngestArgs),

    /// Search atoms by fingerprint prefix
    Search(SearchArgs),

    /// Show one atom and the files that use it
    Atom(HashArgs),

    /// Deduplication statistics
    Stats(StatsArgs),

    /// Atom breakdown of a file, by whole-file fingerprint
    #[command(name = "file-atoms")]
    FileAtoms(HashArgs),

    /// Delete a file and release its atoms
    Delete(DeleteArgs),

    /// Evict orphaned atoms
    Gc(OutputArgs),

    /// Check reference counts and statistics
    Verify(OutputArgs),

    /// Write a stored file (or a byte range of it) to stdout
    Cat(CatArgs),
}

#[derive(Args)]
struct CommandArgs {
    /// Request JSON
    #[arg(long, conflicts_with = "file")]
    json: Option<String>,

    /// Read the request from a file
    #[arg(long)]
    file: Option<PathBuf>,

    /// Pretty-print the response
    #[arg(long)]
    pretty: bool,
}

#[derive(Args)]
struct OutputArgs {
    /// Print the command API response as JSON (implies --quiet)
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct IngestArgs {
    /// Files to ingest
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct SearchArgs {
    /// Hex prefix of the atom fingerprint
    query: String,

    /// Maximum number of atoms to list
    #[arg(short, long)]
    limit: Option<usize>,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct HashArgs {
    /// Full fingerprint (64 hex characters)
    hash: String,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct StatsArgs {
    /// Number of most used atoms to list
    #[arg(long)]
    top: Option<usize>,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct DeleteArgs {
    file_id: String,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct CatArgs {
    file_id: String,

    /// First byte to write
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Number of bytes to write (default: to the end)
    #[arg(long)]
    length: Option<u64>,
}

pub async fn main_entry() -> Result<()> {
    let mut cli = Cli::parse();

    // stdout is reserved for JSON in these modes
    let json = match &cli.command {
        Commands::Command(_) => true,
        Commands::Ingest(args) => args.output.json,
        Commands::Search(args) => args.output.json,
        Commands::Atom(args) | Commands::FileAtoms(args) => args.output.json,
        Commands::Stats(args) => args.output.json,
        Commands::Delete(args) => args.output.json,
        Commands::Gc(args) | Commands::Verify(args) => args.json,
        Commands::Cat(_) => false,
    };
    if json {
        cli.quiet = true;
    }

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let config = load_config(cli.config.as_deref()).await?;
    let store = StoreDir::new(&cli.store);
    let handler = CommandHandler::new(store.clone(), config.clone());

    let success = match cli.command {
        Commands::Command(args) => run_command(&handler, args).await?,
        Commands::Ingest(args) => run_ingest(&store, &config, args, json).await?,
        Commands::Search(args) => {
            let payload = json!({"query": args.query, "limit": args.limit});
            run_action(&handler, CommandAction::SearchAtoms, payload, json, print_search).await?
        }
        Commands::Atom(args) => {
            let payload = json!({"hash": args.hash});
            run_action(&handler, CommandAction::AtomDetail, payload, json, print_atom).await?
        }
        Commands::Stats(args) => {
            let payload = json!({"top": args.top});
            run_action(&handler, CommandAction::DedupStats, payload, json, print_stats).await?
        }
        Commands::FileAtoms(args) => {
            let payload = json!({"hash": args.hash});
            run_action(&handler, CommandAction::FileAtoms, payload, json, print_file_atoms)
                .await?
        }
        Commands::Delete(args) => {
            let payload = json!({"file_id": args.file_id});
            run_action(&handler, CommandAction::DeleteFile, payload, json, print_delete).await?
        }
        Commands::Gc(_) => {
            run_action(&handler, CommandAction::Gc, json!({}), json, print_gc).await?
        }
        Commands::Verify(_) => {
            run_action(&handler, CommandAction::Verify, json!({}), json, print_verify).await?
        }
        Commands::Cat(args) => run_cat(&store, &config, args).await?,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn load_config(path: Option<&Path>) -> Result<AtomstoreConfig> {
    let mut config = match path {
        Some(path) => AtomstoreConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AtomstoreConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("Invalid ATOMSTORE_* environment override")?;
    config.validate()?;
    Ok(config)
}

async fn run_command(handler: &CommandHandler, args: CommandArgs) -> Result<bool> {
    let raw = read_request(&args)?;
    let response = match serde_json::from_str::<CommandRequest>(&raw) {
        Ok(request) => handler.execute(request).await,
        Err(err) => command::invalid_request(format!("invalid command request: {err}")),
    };

    let output = if args.pretty {
        serde_json::to_string_pretty(&response)?
    } else {
        serde_json::to_string(&response)?
    };
    println!("{output}");
    Ok(!response.is_error())
}

fn read_request(args: &CommandArgs) -> Result<String> {
    if let Some(raw) = &args.json {
        return Ok(raw.clone());
    }
    if let Some(path) = &args.file {
        return fs::read_to_string(path)
            .with_context(|| format!("Failed to read JSON from {}", path.display()));
    }

    let mut buffer = String::new();
    io::stdin()
        .read_to_string(&mut buffer)
        .context("Failed to read JSON from stdin")?;

    if buffer.trim().is_empty() {
        anyhow::bail!("Command request is empty. Provide --json, --file, or pipe JSON via stdin.");
    }

    Ok(buffer)
}

/// Run one action; print the raw response with `--json`, a summary otherwise
async fn run_action<T: DeserializeOwned>(
    handler: &CommandHandler,
    action: CommandAction,
    payload: Value,
    json: bool,
    print: fn(T),
) -> Result<bool> {
    let response = handler.execute(CommandRequest { action, payload }).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(!response.is_error());
    }

    match response {
        CommandResponse {
            error: Some(error), ..
        } => {
            eprintln!("error ({}): {}", error.code.as_str(), error.message);
            Ok(false)
        }
        CommandResponse { data, .. } => {
            let data: T = serde_json::from_value(data)
                .with_context(|| format!("Unexpected {} response", action.as_str()))?;
            print(data);
            Ok(true)
        }
    }
}

async fn run_ingest(
    store: &StoreDir,
    config: &AtomstoreConfig,
    args: IngestArgs,
    json: bool,
) -> Result<bool> {
    let _lock = store.lock().await?;
    let pipeline = store.open(config).await?;

    let results = pipeline.ingest_many(args.paths.iter().map(PathBuf::as_path)).await;
    let mut success = true;
    for (path, result) in args.paths.iter().zip(results) {
        let response = match result {
            Ok(record) => CommandResponse::ok(
                serde_json::to_value(command::upload_result(&record))?,
                ResponseMeta::default(),
            ),
            Err(err) => {
                success = false;
                let err = anyhow::Error::from(err);
                let code = classify_error(&err);
                if code == ErrorCode::Internal {
                    log::error!("{}: {err:#}", path.display());
                }
                let message = match code {
                    ErrorCode::Internal => format!("{}: internal error", path.display()),
                    _ => format!("{}: {err:#}", path.display()),
                };
                CommandResponse::error(code, message, ResponseMeta::default())
            }
        };

        if json {
            println!("{}", serde_json::to_string(&response)?);
        } else if let Some(error) = &response.error {
            eprintln!("error ({}): {}", error.code.as_str(), error.message);
        } else {
            let upload: UploadResult = serde_json::from_value(response.data)?;
            print_upload(upload);
        }
    }

    save_after(store, &pipeline).await?;
    Ok(success)
}

async fn save_after(store: &StoreDir, pipeline: &IngestionPipeline) -> Result<()> {
    store
        .save(pipeline)
        .await
        .with_context(|| format!("Failed to save catalog in {}", store.root().display()))
}

async fn run_cat(store: &StoreDir, config: &AtomstoreConfig, args: CatArgs) -> Result<bool> {
    let pipeline = store.open(config).await?;
    let file_id = FileId::new(args.file_id.trim());
    let bytes = match pipeline
        .read_range(&file_id, args.offset, args.length.unwrap_or(u64::MAX))
        .await
    {
        Ok(bytes) => bytes,
        Err(err) if err.is_user_visible() => {
            eprintln!("error: {err}");
            return Ok(false);
        }
        Err(err) => return Err(err).context("Failed to reassemble file"),
    };

    let mut stdout = io::stdout().lock();
    stdout.write_all(&bytes)?;
    stdout.flush()?;
    Ok(true)
}

fn print_upload(upload: UploadResult) {
    println!(
        "{} {} ({} bytes): {} atoms created, {} reused, {:.1}% deduplicated, {} bytes saved",
        upload.file_id,
        upload.filename,
        upload.size,
        upload.atoms_created,
        upload.atoms_reused,
        upload.dedup_ratio * 100.0,
        upload.storage_saved
    );
}

fn print_search(found: SearchResponse) {
    if found.total == 0 {
        println!("No atoms found");
        return;
    }
    for atom in &found.atoms {
        println!(
            "{}  {:>8} bytes  {:<6}  used {}x",
            atom.hash, atom.size, atom.kind, atom.usage_count
        );
    }
    if found.atoms.len() < found.total {
        println!("... {} of {} matches shown", found.atoms.len(), found.total);
    }
}

fn print_atom(atom: AtomView) {
    println!("hash:       {}", atom.hash);
    println!("type:       {}", atom.kind);
    println!("size:       {} bytes", atom.size);
    println!("created_at: {}", atom.created_at.to_rfc3339());
    println!("usage:      {}", atom.usage_count);
    println!("files:      {}", atom.files.join(", "));
}

fn print_stats(stats: DedupStatsView) {
    println!("files:          {}", stats.total_files);
    println!("logical bytes:  {}", stats.total_size);
    println!("physical bytes: {}", stats.physical_size);
    println!("atoms:          {} ({} unique)", stats.total_atoms, stats.unique_atoms);
    println!(
        "saved:          {} bytes ({:.1}%)",
        stats.storage_saved,
        stats.dedup_ratio * 100.0
    );
    println!("avg reuse:      {:.2}", stats.avg_reuse);
    if !stats.top_atoms.is_empty() {
        println!("top atoms:");
        for top in &stats.top_atoms {
            println!("  {}  {}x  {} bytes", top.hash, top.usage_count, top.size);
        }
    }
}

fn print_file_atoms(atoms: FileAtomsResponse) {
    for atom in &atoms.atoms {
        println!(
            "{}  {:>8} bytes  {}  used {}x",
            atom.hash,
            atom.size,
            if atom.is_new { "new   " } else { "reused" },
            atom.reuse_count
        );
    }
}

fn print_delete(deleted: DeleteResult) {
    println!(
        "Deleted {}: {} atoms unlinked, {} orphaned",
        deleted.file_id, deleted.atoms_unlinked, deleted.orphaned
    );
}

fn print_gc(gc: GcResult) {
    println!(
        "Evicted {} atoms ({} bytes), removed {} stray payloads, deferred {}",
        gc.evicted, gc.bytes_freed, gc.stray_payloads, gc.deferred
    );
}

fn print_verify(report: VerifyResult) {
    println!(
        "{}: {} atoms checked, {} orphans",
        if report.ok { "OK" } else { "FAILED" },
        report.atoms_checked,
        report.orphans
    );
    for line in report
        .violations
        .iter()
        .chain(&report.stats_drift)
        .chain(&report.store_mismatches)
    {
        println!("  {line}");
    }
}
