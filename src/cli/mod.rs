//! Command-line surface of the `itemlog` binary.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    db::{helpers::now_ms, LogFilter, Value},
    plugin::Plugin,
    query::SeriesRequest,
    settings::PluginConfig,
    writer::WriteOutcome,
};

#[derive(Parser)]
#[command(author, version, about = "Per-item time-series log", long_about = None)]
pub struct Cli {
    /// JSON settings file
    #[arg(long, short, env = "ITEMLOG_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the numeric identity of an item
    Id {
        item: String,
        /// Allocate an identity for unknown items
        #[arg(long)]
        create: bool,
    },
    /// Record a value change
    Record {
        item: String,
        value: String,
        /// Change time in milliseconds since the epoch (default: now)
        #[arg(long)]
        at: Option<i64>,
    },
    /// Evaluate one aggregate over a window
    Single {
        func: String,
        item: String,
        #[arg(long, default_value = "0")]
        start: String,
        #[arg(long, default_value = "now")]
        end: String,
    },
    /// Evaluate a bucketed series and print it as JSON
    Series {
        func: String,
        item: String,
        #[arg(long, default_value = "0")]
        start: String,
        #[arg(long, default_value = "now")]
        end: String,
        #[arg(long)]
        step: Option<i64>,
        #[arg(long)]
        count: Option<u32>,
    },
    /// List known items as JSON
    Items,
    /// Export log records as JSON
    Dump {
        /// Restrict the export to one item
        #[arg(long)]
        item: Option<String>,
        /// Write to this file instead of stdout
        #[arg(long, short)]
        out: Option<PathBuf>,
        #[arg(long)]
        time_start: Option<i64>,
        #[arg(long)]
        time_end: Option<i64>,
        #[arg(long)]
        changed_start: Option<i64>,
        #[arg(long)]
        changed_end: Option<i64>,
    },
    /// Apply the configured max-age retention once
    Sweep,
}

pub async fn handle(cli: Cli) -> Result<()> {
    let config = PluginConfig::load(&cli.config)?;
    let plugin = Plugin::open(config)?;

    match cli.command {
        Commands::Id { item, create } => {
            let id = plugin.id(&item, create).await?;
            println!("{id}");
        }
        Commands::Record { item, value, at } => {
            plugin.parse_item(&item).await?;
            let time = at.unwrap_or_else(now_ms);
            match plugin.on_change(&item, Value::parse_loose(&value), time).await? {
                WriteOutcome::Appended { closed: Some((start, duration)) } => {
                    println!("recorded {item}@{time} (closed {start}+{duration})")
                }
                WriteOutcome::Appended { closed: None } => println!("recorded {item}@{time}"),
                WriteOutcome::Dropped => println!("dropped {item}@{time}"),
                WriteOutcome::Ignored => println!("ignored {item} (read-only)"),
            }
        }
        Commands::Single {
            func,
            item,
            start,
            end,
        } => match plugin.single(&func, &start, &end, &item).await? {
            Some(value) => println!("{value}"),
            None => println!("null"),
        },
        Commands::Series {
            func,
            item,
            start,
            end,
            step,
            count,
        } => {
            let mut request = SeriesRequest::new(&func, &item, &start, &end);
            request.step = step;
            request.count = count;
            let response = plugin.series(&request).await?;
            let json = serde_json::to_string_pretty(&response)
                .context("failed to encode series response")?;
            println!("{json}");
        }
        Commands::Items => {
            let items = plugin.items().await?;
            let json =
                serde_json::to_string_pretty(&items).context("failed to encode item list")?;
            println!("{json}");
        }
        Commands::Dump {
            item,
            out,
            time_start,
            time_end,
            changed_start,
            changed_end,
        } => {
            let filter = LogFilter {
                time_start,
                time_end,
                ..LogFilter::default()
            }
            .changed_between(changed_start, changed_end);
            let entries = plugin.dump(item.as_deref(), filter).await?;
            let json =
                serde_json::to_string_pretty(&entries).context("failed to encode log dump")?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("failed to write dump to {}", path.display()))?;
                    println!("dumped {} records to {}", entries.len(), path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::Sweep => {
            let names: Vec<String> = plugin.config().item_attributes.keys().cloned().collect();
            for name in names {
                plugin.parse_item(&name).await?;
            }
            let deleted = plugin.retention().sweep_once(now_ms()).await?;
            println!("deleted {deleted} records");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_series_arguments() {
        let cli = Cli::try_parse_from([
            "itemlog", "--config", "itemlog.json", "series", "avg", "main.num", "--start", "1d",
            "--step", "60000",
        ])
        .unwrap();

        match cli.command {
            Commands::Series {
                func, start, end, step, count, ..
            } => {
                assert_eq!(func, "avg");
                assert_eq!(start, "1d");
                assert_eq!(end, "now");
                assert_eq!(step, Some(60000));
                assert_eq!(count, None);
            }
            _ => panic!("expected series command"),
        }
    }

    #[test]
    fn test_parse_dump_arguments() {
        let cli = Cli::try_parse_from([
            "itemlog", "-c", "itemlog.json", "dump", "--item", "main.num", "--changed-start",
            "5000", "-o", "dump.json",
        ])
        .unwrap();

        match cli.command {
            Commands::Dump {
                item,
                out,
                time_start,
                changed_start,
                changed_end,
                ..
            } => {
                assert_eq!(item.as_deref(), Some("main.num"));
                assert_eq!(out, Some(PathBuf::from("dump.json")));
                assert_eq!(time_start, None);
                assert_eq!(changed_start, Some(5000));
                assert_eq!(changed_end, None);
            }
            _ => panic!("expected dump command"),
        }
    }
}
