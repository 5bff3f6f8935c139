use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind as ClapErrorKind;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use book_tools::annas::{AnnasBackend, SystemAnnasTool};
use book_tools::app::App;
use book_tools::config::{CredentialStore, CredentialUpdate};
use book_tools::domain::{DownloadRequest, SearchQuery, Source, SourceSelection, YearRange};
use book_tools::error::BookError;
use book_tools::output::JsonOutput;
use book_tools::session::SessionCache;
use book_tools::store::Store;
use book_tools::zlib::{ZlibBackend, ZlibraryHttpClient};

#[derive(Parser)]
#[command(name = "book")]
#[command(about = "Search and download books from Z-Library and Anna's Archive (JSON output)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search for books")]
    Search(SearchArgs),
    #[command(about = "Download a book")]
    Download(DownloadArgs),
    #[command(about = "Show book details (zlib only)")]
    Info(InfoArgs),
    #[command(about = "Manage configuration")]
    Config(ConfigArgs),
    #[command(about = "Report which backends are ready to use")]
    Setup,
}

#[derive(Args)]
struct SearchArgs {
    query: String,

    #[arg(long, value_enum, default_value_t = SourceSelection::Auto)]
    source: SourceSelection,

    #[arg(long)]
    limit: Option<u32>,

    #[arg(long)]
    lang: Option<String>,

    #[arg(long)]
    ext: Option<String>,

    #[arg(long)]
    year_from: Option<u32>,

    #[arg(long)]
    year_to: Option<u32>,
}

#[derive(Args)]
struct DownloadArgs {
    #[arg(long, value_enum)]
    source: Source,

    #[arg(long)]
    id: Option<String>,

    #[arg(long)]
    hash: String,

    #[arg(long)]
    filename: Option<String>,

    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct InfoArgs {
    #[arg(long, value_enum, default_value_t = Source::Zlib)]
    source: Source,

    #[arg(long)]
    id: String,

    #[arg(long)]
    hash: String,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    #[command(about = "Show current config with secrets masked")]
    Show,
    #[command(about = "Set config values")]
    Set(ConfigSetArgs),
    #[command(about = "Delete the managed config file")]
    Reset,
}

#[derive(Args)]
struct ConfigSetArgs {
    #[arg(long)]
    zlib_email: Option<String>,
    #[arg(long)]
    zlib_password: Option<String>,
    #[arg(long)]
    annas_key: Option<String>,
    #[arg(long)]
    annas_binary: Option<String>,
    #[arg(long)]
    annas_download_path: Option<String>,
    #[arg(long)]
    annas_mirror: Option<String>,
    #[arg(long)]
    download_dir: Option<String>,
}

impl From<ConfigSetArgs> for CredentialUpdate {
    fn from(args: ConfigSetArgs) -> Self {
        CredentialUpdate {
            email: args.zlib_email,
            password: args.zlib_password,
            api_key: args.annas_key,
            binary_path: args.annas_binary,
            annas_download_path: args.annas_download_path,
            mirror_url: args.annas_mirror,
            default_download_dir: args.download_dir,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                let _ = err.print();
                return ExitCode::SUCCESS;
            }
            _ => {
                let err = BookError::Invalid(err.render().to_string().trim().to_string());
                return report(&err);
            }
        },
    };

    if let Err(report_err) = run(cli) {
        if let Some(err) = report_err.downcast_ref::<BookError>() {
            return report(err);
        }
        return report(&BookError::Filesystem(report_err.to_string()));
    }
    ExitCode::SUCCESS
}

fn report(err: &BookError) -> ExitCode {
    if JsonOutput::print_error(err).is_err() {
        eprintln!("{err}");
    }
    ExitCode::from(err.kind().exit_code())
}

fn run(cli: Cli) -> miette::Result<()> {
    let store = Store::new()?;
    let credentials = CredentialStore::new(store.clone());

    match cli.command {
        Commands::Config(args) => run_config(args.command, &credentials),
        Commands::Search(args) => {
            let query = SearchQuery {
                text: args.query,
                limit: args.limit,
                language: args.lang,
                extension: args.ext,
                years: YearRange {
                    from: args.year_from,
                    to: args.year_to,
                },
            };
            query.validate()?;
            let app = build_app(&store, &credentials)?;
            let result = app.search(&query, args.source)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Commands::Info(args) => {
            let app = build_app(&store, &credentials)?;
            let result = app.info(args.source.into(), &args.id, &args.hash)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Commands::Download(args) => {
            let request = DownloadRequest {
                id: args.id,
                hash: args.hash,
                filename: args.filename,
            };
            request.validate(args.source)?;
            let app = build_app(&store, &credentials)?;
            let result = app.download(args.source, &request, args.output)?;
            JsonOutput::print(&result).into_diagnostic()
        }
        Commands::Setup => {
            let app = build_app(&store, &credentials)?;
            JsonOutput::print(&app.setup()).into_diagnostic()
        }
    }
}

fn build_app(
    store: &Store,
    credentials: &CredentialStore,
) -> Result<App<ZlibBackend<ZlibraryHttpClient>, AnnasBackend<SystemAnnasTool>>, BookError> {
    let resolved = credentials.resolve()?;
    let zlib = ZlibBackend::new(
        ZlibraryHttpClient::new()?,
        resolved.clone(),
        SessionCache::new(store.clone()),
    );
    let annas = AnnasBackend::new(
        SystemAnnasTool::new(resolved.binary_path.as_deref()),
        resolved.clone(),
    );
    Ok(App::new(resolved, zlib, annas))
}

fn run_config(command: ConfigCommand, credentials: &CredentialStore) -> miette::Result<()> {
    match command {
        ConfigCommand::Show => JsonOutput::print(&credentials.show()?).into_diagnostic(),
        ConfigCommand::Set(args) => {
            let result = credentials.set(args.into())?;
            JsonOutput::print(&result).into_diagnostic()
        }
        ConfigCommand::Reset => JsonOutput::print(&credentials.reset()?).into_diagnostic(),
    }
}
