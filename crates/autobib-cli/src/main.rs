use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use autobib_core::config_file;
use autobib_core::pipeline::{fetch_issue, generate_filename};
use autobib_core::pool::{ProgressEvent, run_batch};
use autobib_core::{Ark, CacheTable, ResolutionCache, RunContext, Settings};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod output;

use output::ColorMode;

/// Automatically fetch clean PDFs of journal articles from Gallica
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level: 0 = errors, 1 = info, 2 = debug (RUST_LOG overrides)
    #[arg(long, global = true, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
    verbosity: u8,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Retrieve every entry of a .bib or .ris file into a directory
    Process {
        /// Bibliography to process (.bib or .ris)
        bibfile: PathBuf,

        /// Directory to write PDFs into
        outdir: PathBuf,

        /// Keep the raw download without cleaning pages
        #[arg(long)]
        no_post_process: bool,

        /// Crop heuristically instead of from the archive's OCR geometry
        #[arg(long)]
        no_ocr_bounds: bool,

        /// Rebuild pages from filtered images, dropping the text layer
        #[arg(long)]
        no_preserve_text: bool,

        /// Pad every page to the same size
        #[arg(long)]
        equal_size: bool,

        /// Number of entries processed at once
        #[arg(long)]
        processes: Option<usize>,

        /// Keep the raw download next to the cleaned file
        #[arg(long)]
        no_clean: bool,

        /// Resolve every entry afresh (results are still cached)
        #[arg(long)]
        ignore_cache: bool,

        /// Drop the archive's cover page
        #[arg(long)]
        suppress_cover_page: bool,

        /// Write the report here instead of stdout (.json for machine-readable)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },

    /// Download a whole issue by ark
    Fetch {
        /// Issue ark, bare or inside a URL
        ark: String,

        /// Output PDF
        outf: PathBuf,

        /// Keep the raw download without cleaning pages
        #[arg(long)]
        no_post_process: bool,

        /// Rebuild pages from filtered images, dropping the text layer
        #[arg(long)]
        no_preserve_text: bool,

        /// Keep the raw download next to the cleaned file
        #[arg(long)]
        no_clean: bool,

        /// Drop the archive's cover pages
        #[arg(long)]
        suppress_cover_page: bool,
    },

    /// Inspect or persist configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Manage the resolution cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the merged configuration as TOML
    Show,
    /// Print the platform config file path
    Path,
    /// Write the merged configuration to the platform config file
    Save,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Empty the cache, or one table of it
    Clear {
        /// ark, match or ocr_bounds
        #[arg(long)]
        table: Option<String>,
    },
}

/// Command-line overrides applied last, over config file and environment.
#[derive(Debug, Default)]
struct Overrides {
    no_post_process: bool,
    no_ocr_bounds: bool,
    no_preserve_text: bool,
    equal_size: bool,
    processes: Option<usize>,
    no_clean: bool,
    ignore_cache: bool,
    suppress_cover_page: bool,
}

impl Overrides {
    fn apply(&self, settings: &mut Settings) {
        let p = &mut settings.processing;
        if self.no_post_process {
            p.post_process = false;
        }
        if self.no_ocr_bounds {
            p.ocr_bounds = false;
        }
        if self.no_preserve_text {
            p.preserve_text = false;
        }
        if self.equal_size {
            p.equal_size = true;
        }
        if let Some(n) = self.processes {
            p.workers = n.max(1);
        }
        if self.no_clean {
            p.clean = false;
        }
        if self.suppress_cover_page {
            p.suppress_cover = true;
        }
        if self.ignore_cache {
            settings.ignore_cache = true;
        }
    }
}

/// Resolve configuration: CLI flags > env vars > config file > defaults.
fn resolve_settings(overrides: &Overrides) -> Settings {
    let file = config_file::load_config();
    let mut settings = Settings::from_config(&file);
    settings.apply_env(|k| std::env::var(k).ok());
    overrides.apply(&mut settings);
    settings
}

fn init_logging(verbosity: u8, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let level = match verbosity {
        0 => "error",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _guard = init_logging(cli.verbosity, cli.log_file.as_deref())?;

    match cli.command {
        Command::Process {
            bibfile,
            outdir,
            no_post_process,
            no_ocr_bounds,
            no_preserve_text,
            equal_size,
            processes,
            no_clean,
            ignore_cache,
            suppress_cover_page,
            out,
            no_color,
        } => {
            let overrides = Overrides {
                no_post_process,
                no_ocr_bounds,
                no_preserve_text,
                equal_size,
                processes,
                no_clean,
                ignore_cache,
                suppress_cover_page,
            };
            process(bibfile, outdir, &overrides, out, no_color).await
        }
        Command::Fetch {
            ark,
            outf,
            no_post_process,
            no_preserve_text,
            no_clean,
            suppress_cover_page,
        } => {
            let overrides = Overrides {
                no_post_process,
                no_preserve_text,
                no_clean,
                suppress_cover_page,
                ..Default::default()
            };
            fetch(&ark, &outf, &overrides).await
        }
        Command::Config { action } => config(action),
        Command::Cache { action } => cache(action),
    }
}

async fn process(
    bibfile: PathBuf,
    outdir: PathBuf,
    overrides: &Overrides,
    out: Option<PathBuf>,
    no_color: bool,
) -> anyhow::Result<()> {
    if !bibfile.exists() {
        bail!("File not found: {}", bibfile.display());
    }
    let records = autobib_bib::parse_path(&bibfile)
        .with_context(|| format!("cannot read {}", bibfile.display()))?;
    std::fs::create_dir_all(&outdir)
        .with_context(|| format!("cannot create {}", outdir.display()))?;

    let use_color = !no_color && out.is_none();
    let color = ColorMode(use_color);

    let settings = resolve_settings(overrides);
    let ctx = Arc::new(RunContext::new(settings)?);

    let bar = ProgressBar::new(records.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{bar:40.cyan/dim}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    let progress_bar = bar.clone();
    let progress = move |event: ProgressEvent| match event {
        ProgressEvent::Started { title, .. } => {
            progress_bar.set_message(output::truncate(&title, 40));
        }
        ProgressEvent::Finished { .. } => progress_bar.inc(1),
    };

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let outcomes = run_batch(records, &outdir, ctx.clone(), progress, cancel).await;
    bar.finish_and_clear();
    if let Err(e) = ctx.flush() {
        tracing::warn!(error = %e, "failed to flush cache");
    }

    let out = out.map(|path| generate_filename(&path));
    match out {
        Some(ref path) if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json")) => {
            let json = serde_json::to_string_pretty(&outcomes)?;
            std::fs::write(path, json)
                .with_context(|| format!("cannot write report {}", path.display()))?;
        }
        _ => {
            let mut writer: Box<dyn Write> = if let Some(ref path) = out {
                Box::new(std::fs::File::create(path)?)
            } else {
                Box::new(std::io::stdout())
            };
            output::print_report(&mut writer, &outcomes, color)?;
            output::print_summary(&mut writer, &outcomes, color)?;
        }
    }
    if let Some(ref path) = out {
        eprintln!("Report written to {}", path.display());
    }

    if !outcomes.is_empty() && outcomes.iter().all(|o| !o.status.is_success()) {
        bail!("no entry could be retrieved");
    }
    Ok(())
}

async fn fetch(ark: &str, outf: &Path, overrides: &Overrides) -> anyhow::Result<()> {
    let ark = Ark::parse(ark)?;
    let ctx = RunContext::new(resolve_settings(overrides))?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("Fetching {ark}..."));
    spinner.enable_steady_tick(Duration::from_millis(120));
    let result = fetch_issue(&ctx, &ark, outf).await;
    spinner.finish_and_clear();
    if let Err(e) = ctx.flush() {
        tracing::warn!(error = %e, "failed to flush cache");
    }

    let path = result.with_context(|| format!("failed to fetch {ark}"))?;
    println!("{}", path.display());
    Ok(())
}

fn config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let merged = config_file::load_config();
            print!("{}", toml::to_string_pretty(&merged)?);
        }
        ConfigAction::Path => match config_file::config_path() {
            Some(path) => println!("{}", path.display()),
            None => bail!("Could not determine config directory"),
        },
        ConfigAction::Save => {
            let merged = config_file::load_config();
            let path = config_file::save_config(&merged).map_err(anyhow::Error::msg)?;
            println!("Saved {}", path.display());
        }
    }
    Ok(())
}

fn cache(action: CacheAction) -> anyhow::Result<()> {
    let CacheAction::Clear { table } = action;
    let settings = resolve_settings(&Overrides::default());
    let Some(path) = settings.cache_path else {
        bail!("the cache is disabled");
    };
    if !path.exists() {
        println!("No cache at {}", path.display());
        return Ok(());
    }
    let cache = ResolutionCache::open(&path)?;
    match table {
        Some(name) => {
            let table = CacheTable::from_str(&name)?;
            let removed = cache.clear_table(table)?;
            println!("Removed {removed} entries from {table}");
        }
        None => {
            cache.clear()?;
            println!("Cleared {}", path.display());
        }
    }
    Ok(())
}
