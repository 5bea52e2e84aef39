use clap::{Parser, Subcommand};
use hayate_pager::image::ContentSource;
use hayate_pager::{ReaderServices, ReaderState, ReadingDirection, Settings};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "hayate-pager", version = VERSION)]
#[command(about = "Inspect how images, folders and CBZ archives paginate")]
struct Cli {
    /// Settings file; created with defaults when missing.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print every page label in reading order.
    List {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Open a document, move to a page and print what is on screen.
    Show {
        #[arg(value_name = "PATH")]
        path: PathBuf,
        /// Page to jump to (0-based).
        #[arg(long)]
        page: Option<usize>,
        /// Pages (or spreads) to turn after the jump; negative turns back.
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        turn: isize,
        #[arg(long)]
        double: bool,
        #[arg(long)]
        rtl: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load_or_default(&cli.config);
    if !cli.config.exists() {
        if let Err(e) = settings.save(&cli.config) {
            tracing::warn!(
                path = %cli.config.display(),
                error = %e,
                "Could not write default settings"
            );
        }
    }

    let result = match cli.command {
        Commands::List { path } => run_list(&settings, &path).await,
        Commands::Show {
            path,
            page,
            turn,
            double,
            rtl,
        } => {
            let mut settings = settings;
            settings.is_double_page |= double;
            if rtl {
                settings.reading_direction = ReadingDirection::RightToLeft;
            }
            run_show(&settings, &path, page, turn).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_list(settings: &Settings, path: &Path) -> hayate_pager::Result<()> {
    let services = ReaderServices::from_settings(settings)?;
    let source = ContentSource::open(path, &services.index, services.access.as_ref()).await?;
    for (i, label) in source.labels().iter().enumerate() {
        println!("{i:>5}  {label}");
    }
    Ok(())
}

async fn run_show(
    settings: &Settings,
    path: &Path,
    page: Option<usize>,
    turn: isize,
) -> hayate_pager::Result<()> {
    let services = ReaderServices::from_settings(settings)?;
    let mut reader = ReaderState::new(services, settings)?;
    let outcome = async {
        reader.load_content(path).await?;
        if let Some(page) = page {
            reader.jump(page).await?;
        }
        if turn != 0 {
            reader.navigate(turn).await?;
        }
        Ok::<(), hayate_pager::PagerError>(())
    }
    .await;

    if outcome.is_ok() {
        println!("{} / {} pages", reader.current_page_index(), reader.total_pages());
        for (index, image) in reader.displayed_pages().into_iter().zip(reader.current_images()) {
            let label = reader.page_label(index).unwrap_or_default();
            println!("{index:>5}  {label}  {}x{}", image.width, image.height);
        }
        let stats = reader.cache_stats();
        tracing::info!(
            hits = stats.hits,
            misses = stats.misses,
            cached = ?reader.cached_pages(),
            "Cache"
        );
    }
    reader.close().await;
    outcome
}
