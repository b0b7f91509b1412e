use std::path::PathBuf;

use anyhow::Result;
use auditdash_sync::{ConvertConfig, ConvertPipeline, ScrapeMode};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "auditdash")]
#[command(about = "Convert the audit recommendations workbook into dashboard data files")]
struct Cli {
    /// YAML config file (defaults to ./auditdash.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Recommendations workbook (.xlsx)
    #[arg(long, global = true)]
    input: Option<PathBuf>,

    /// Records script to write
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    /// Report URL cache file
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    #[arg(long, global = true)]
    summaries_csv: Option<PathBuf>,

    #[arg(long, global = true)]
    summaries_output: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build the records artifact (and summaries when the CSV exists)
    Convert {
        /// Use only the URL cache; never contact the listing
        #[arg(long)]
        no_scrape: bool,
        /// Same as --no-scrape
        #[arg(long)]
        from_cache_only: bool,
    },
    /// Regenerate only the summaries artifact
    Summaries,
}

impl Cli {
    fn apply_overrides(&self, config: &mut ConvertConfig) {
        if let Some(path) = &self.input {
            config.xlsx_file = path.clone();
        }
        if let Some(path) = &self.output {
            config.output_file = path.clone();
        }
        if let Some(path) = &self.cache {
            config.cache_file = path.clone();
        }
        if let Some(path) = &self.summaries_csv {
            config.summaries_csv = path.clone();
        }
        if let Some(path) = &self.summaries_output {
            config.summaries_file = path.clone();
        }
    }
}

fn scrape_mode(no_scrape: bool, from_cache_only: bool) -> ScrapeMode {
    if from_cache_only {
        ScrapeMode::CacheOnly
    } else if no_scrape {
        ScrapeMode::NoScrape
    } else {
        ScrapeMode::Normal
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("AUDITDASH_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = ConvertConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    let pipeline = ConvertPipeline::new(config)?;

    let command = cli.command.unwrap_or(Commands::Convert {
        no_scrape: false,
        from_cache_only: false,
    });
    match command {
        Commands::Convert {
            no_scrape,
            from_cache_only,
        } => {
            let mode = scrape_mode(no_scrape, from_cache_only);
            let summary = pipeline.run_once(mode).await?;
            println!(
                "convert complete: run_id={} rows={} reports={} urls={}/{} records={} output={}",
                summary.run_id,
                summary.rows_read,
                summary.unique_reports,
                summary.urls_found,
                summary.unique_reports,
                summary.records_written,
                summary.output_file
            );
            if let (Some(count), Some(path)) = (summary.summaries_written, &summary.summaries_file) {
                println!("summaries: {count} -> {path}");
            }
        }
        Commands::Summaries => match pipeline.write_summaries().await? {
            Some((count, artifact)) => {
                println!("summaries: {count} -> {}", artifact.path.display());
            }
            None => {
                tracing::warn!("no summaries written");
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert_mode(args: &[&str]) -> ScrapeMode {
        let cli = Cli::try_parse_from(args).expect("valid arguments");
        match cli.command {
            Some(Commands::Convert {
                no_scrape,
                from_cache_only,
            }) => scrape_mode(no_scrape, from_cache_only),
            other => panic!("expected convert, got {other:?}"),
        }
    }

    #[test]
    fn offline_flags_may_be_combined() {
        assert_eq!(
            convert_mode(&["auditdash", "convert", "--no-scrape", "--from-cache-only"]),
            ScrapeMode::CacheOnly
        );
        assert_eq!(convert_mode(&["auditdash", "convert", "--no-scrape"]), ScrapeMode::NoScrape);
        assert_eq!(convert_mode(&["auditdash", "convert"]), ScrapeMode::Normal);
    }

    #[test]
    fn global_paths_apply_after_subcommand() {
        let cli = Cli::try_parse_from(["auditdash", "convert", "--input", "in.xlsx", "--output", "out.js"])
            .expect("valid arguments");
        let mut config = ConvertConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.xlsx_file, PathBuf::from("in.xlsx"));
        assert_eq!(config.output_file, PathBuf::from("out.js"));
    }
}
