mod catalog;
mod tools;

use anyhow::{Context, Result};
use catalog::Catalog;
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tools::resolve::OutputFormat;
use tracing_subscriber::EnvFilter;
use unilink_core::{EngineConfig, InMemoryPages};

#[derive(Parser)]
#[command(version, about = "Resolve [bracket] and #tag references against a page catalog")]
#[command(propagate_version = true)]
struct Cli {
    /// Log engine activity at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the references recognized in a file
    Links {
        file: PathBuf,
    },
    /// Resolve every reference in a file against a page catalog
    Resolve {
        file: PathBuf,

        /// TOML page catalog (`[[page]]` entries with `id` and `title`)
        #[arg(long, env = "UNILINK_PAGES")]
        pages: PathBuf,

        /// Engine configuration file
        #[arg(long, env = "UNILINK_CONFIG")]
        config: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },
    /// Convert delimiter syntax into created references and print the
    /// persisted form
    Migrate {
        file: PathBuf,

        /// Page catalog used to resolve the migrated references
        #[arg(long, env = "UNILINK_PAGES")]
        pages: Option<PathBuf>,

        #[arg(long, env = "UNILINK_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("unilink=debug,unilink_core=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("unilink=info,unilink_core=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_input(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path).context("Failed to load engine configuration"),
        None => Ok(EngineConfig::default()),
    }
}

fn load_pages(path: Option<&Path>) -> Result<InMemoryPages> {
    match path {
        Some(path) => Ok(Catalog::load(path)?.into_pages()),
        None => Ok(InMemoryPages::new()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let output = match cli.command {
        Commands::Links { file } => tools::links::execute(&read_input(&file)?),
        Commands::Resolve {
            file,
            pages,
            config,
            format,
            no_color,
        } => {
            let content = read_input(&file)?;
            let config = load_config(config.as_deref())?;
            let pages = load_pages(Some(&pages))?;
            let color = !no_color && std::io::stdout().is_terminal();
            tools::resolve::execute(&content, pages, config, format, color).await?
        }
        Commands::Migrate {
            file,
            pages,
            config,
        } => {
            let content = read_input(&file)?;
            let config = load_config(config.as_deref())?;
            let pages = load_pages(pages.as_deref())?;
            tools::migrate::execute(&content, pages, config).await?
        }
    };

    print!("{}", output);
    if !output.ends_with('\n') {
        println!();
    }
    Ok(())
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
    fn parses_resolve_arguments() {
        let cli = Cli::try_parse_from([
            "unilink", "resolve", "notes.md", "--pages", "pages.toml", "--format", "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Resolve { file, format, .. } => {
                assert_eq!(file, PathBuf::from("notes.md"));
                assert_eq!(format, OutputFormat::Json);
            }
            _ => panic!("expected resolve"),
        }
    }

    #[test]
    fn missing_config_file_names_path() {
        let err = load_config(Some(Path::new("/nonexistent/unilink.toml"))).unwrap_err();
        assert!(format!("{:#}", err).contains("unilink.toml"));
    }
}
