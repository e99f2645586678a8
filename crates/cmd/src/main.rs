// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use snafu::{ResultExt, Whatever, whatever};
use splice_app::AppConfig;
use splice_base::ReadableSize;
use splice_common_telemetry::{LogFormat, LoggingOptions, init_global_logging};
use splice_server::http::RestServerConfig;
use splice_staging::{
    Layout, MergeStrategy, RangeReader, SessionSpec, Stager, StagingConfig, StagingError,
    validate_name,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
#[clap(
name = "splice",
about = "Chunked upload staging and reassembly",
author = env!("CARGO_PKG_AUTHORS"),
version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Server(ServerArgs),
    Merge(MergeArgs),
    Stat(StatArgs),
}

#[derive(Debug, Clone, Args)]
struct LogArgs {
    /// Log level filter, e.g. `info` or `info,splice_staging=debug`
    #[arg(long)]
    log_level:  Option<String>,
    /// Directory for rolling log files; stdout only when unset
    #[arg(long)]
    log_dir:    Option<String>,
    /// Log output format: `text` or `json`
    #[arg(long, default_value = "text", value_parser = parse_log_format)]
    log_format: LogFormat,
}

impl LogArgs {
    fn options(&self) -> LoggingOptions {
        LoggingOptions {
            dir: self.log_dir.clone().unwrap_or_default(),
            level: self.log_level.clone(),
            log_format: self.log_format,
            ..LoggingOptions::default()
        }
    }
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    match value.to_ascii_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format {other:?}, expected text or json")),
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Starts the splice server.
Examples:

splice server --root ./files --bind 0.0.0.0:3000

")]
struct ServerArgs {
    /// Staging root directory
    #[arg(long, default_value = "files")]
    root:                 PathBuf,
    /// Address the REST server binds to
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind:                 String,
    /// Largest artifact a buffered merge may produce, e.g. `64MiB`
    #[arg(long)]
    buffered_merge_limit: Option<ReadableSize>,
    #[command(flatten)]
    log:                  LogArgs,
}

impl ServerArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let mut staging = StagingConfig {
            root_dir: self.root.clone(),
            ..StagingConfig::default()
        };
        if let Some(limit) = self.buffered_merge_limit {
            staging.buffered_merge_limit = limit;
        }

        let app = AppConfig {
            staging,
            http_config: RestServerConfig {
                bind_address: self.bind.clone(),
                ..RestServerConfig::default()
            },
            logging: self.log.options(),
            ..AppConfig::default()
        }
        .open();
        app.run().await
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Merges the chunks staged under a name into its artifact, without a server.
Examples:

splice merge --root ./files --name movie.mp4
splice merge --root ./files --name movie.mp4 --chunks 12 --strategy streamed

")]
struct MergeArgs {
    /// Staging root directory
    #[arg(long, default_value = "files")]
    root:     PathBuf,
    /// Artifact name
    #[arg(long)]
    name:     String,
    /// `buffered`, `streamed` or `auto`; the configured default when unset
    #[arg(long)]
    strategy: Option<MergeStrategy>,
    /// Declare the chunk count before merging
    #[arg(long)]
    chunks:   Option<u64>,
    #[command(flatten)]
    log:      LogArgs,
}

impl MergeArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let _guards = init_global_logging("splice", &self.log.options());
        let stager = open_stager(&self.root).await?;

        if let Some(chunks) = self.chunks {
            match stager.session(&self.name) {
                Ok(_) => {
                    stager
                        .complete(&self.name, chunks)
                        .await
                        .whatever_context("Failed to declare chunk count")?;
                }
                Err(StagingError::SessionNotFound { .. }) => {
                    let spec = SessionSpec::builder().expected_chunks(chunks).build();
                    stager
                        .begin(&self.name, spec)
                        .await
                        .whatever_context("Failed to begin session")?;
                }
                Err(e) => whatever!("Failed to look up session {}: {e}", self.name),
            }
        }

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling merge");
                on_interrupt.cancel();
            }
        });

        let strategy = self.strategy.unwrap_or(stager.config().default_strategy);
        let artifact = stager
            .merge_with(&self.name, strategy, &cancel)
            .await
            .with_whatever_context(|e| format!("Failed to merge {}: {e}", self.name))?;
        println!(
            "{}",
            serde_json::json!({
                "name": artifact.name,
                "path": artifact.path,
                "size": artifact.size,
                "chunks": artifact.chunk_count,
                "strategy": artifact.strategy,
                "sha256": artifact.sha256,
                "duration": artifact.duration.to_string(),
            })
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Prints the size of a merged artifact. Safe to run next to a server using the
same root.
Examples:

splice stat --root ./files --name movie.mp4

")]
struct StatArgs {
    /// Staging root directory
    #[arg(long, default_value = "files")]
    root: PathBuf,
    /// Artifact name
    #[arg(long)]
    name: String,
}

impl StatArgs {
    async fn run(&self) -> Result<(), Whatever> {
        validate_name(&self.name).whatever_context("Invalid artifact name")?;
        let reader = RangeReader::new(
            Layout::new(&self.root),
            StagingConfig::default().io_buffer_size.as_usize(),
        );
        let stat = reader
            .stat(&self.name)
            .await
            .with_whatever_context(|e| format!("Failed to stat {}: {e}", self.name))?;
        println!(
            "{}",
            serde_json::json!({ "size": stat.size, "fileName": stat.display_name })
        );
        Ok(())
    }
}

async fn open_stager(root: &std::path::Path) -> Result<Stager, Whatever> {
    Stager::open(StagingConfig {
        root_dir: root.to_path_buf(),
        ..StagingConfig::default()
    })
    .await
    .with_whatever_context(|e| format!("Failed to open {}: {e}", root.display()))
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    match cli.commands {
        Commands::Server(args) => args.run().await,
        Commands::Merge(args) => args.run().await,
        Commands::Stat(args) => args.run().await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_well_formed() { Cli::command().debug_assert(); }

    #[test]
    fn test_parse_merge_args() {
        let cli = Cli::parse_from([
            "splice", "merge", "--root", "/data", "--name", "f", "--strategy", "streamed",
            "--chunks", "3",
        ]);
        let Commands::Merge(args) = cli.commands else {
            panic!("expected merge command");
        };
        assert_eq!(args.root, PathBuf::from("/data"));
        assert_eq!(args.strategy, Some(MergeStrategy::Streamed));
        assert_eq!(args.chunks, Some(3));
    }

    #[test]
    fn test_parse_server_args() {
        let cli = Cli::parse_from([
            "splice",
            "server",
            "--bind",
            "0.0.0.0:8080",
            "--buffered-merge-limit",
            "16MiB",
            "--log-format",
            "json",
        ]);
        let Commands::Server(args) = cli.commands else {
            panic!("expected server command");
        };
        assert_eq!(args.bind, "0.0.0.0:8080");
        assert_eq!(args.buffered_merge_limit, Some(ReadableSize::mb(16)));
        assert_eq!(args.log.log_format, LogFormat::Json);
        assert_eq!(args.root, PathBuf::from("files"));
    }
}
