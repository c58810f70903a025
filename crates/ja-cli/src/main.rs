//! # ja — Job Analytics command line
//!
//! Thin HTTP client for `ja-hub`.
//!
//! - `ja analytics <dimension> --from <date> --to <date>`: bucket table.
//! - `ja ingest <file.json>`: push a batch of raw records.
//! - `ja count --from <date> --to <date>`: record coverage.
//! - `ja cache info|clear`, `ja health`.
//!
//! The hub address comes from `JA_BASE_URL` (default `http://127.0.0.1:8000`).

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use ja_core::{Dimension, Granularity, Seniority};
use serde::Deserialize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

#[derive(Parser)]
#[command(name = "ja", version, about = "Job Analytics client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate one dimension over a date window.
    Analytics {
        /// salary, skills, volume, seniority or geography
        dimension: Dimension,

        #[command(flatten)]
        window: WindowArgs,

        /// day, week or month (volume only)
        #[arg(long)]
        granularity: Option<Granularity>,

        #[command(flatten)]
        filters: FilterArgs,

        /// Print the raw JSON response.
        #[arg(long)]
        json: bool,
    },

    /// Send a JSON batch file (array or `{"items": [...]}`) to the hub.
    Ingest { file: PathBuf },

    /// Count records in a window.
    Count {
        #[command(flatten)]
        window: WindowArgs,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Inspect or clear the result cache.
    Cache {
        #[command(subcommand)]
        action: CacheCmd,
    },

    /// Check that the hub is up.
    Health,
}

#[derive(Subcommand)]
enum CacheCmd {
    Info,
    Clear,
}

#[derive(Args)]
struct WindowArgs {
    /// First day of the window (inclusive), YYYY-MM-DD.
    #[arg(long)]
    from: NaiveDate,

    /// Day after the window (exclusive), YYYY-MM-DD.
    #[arg(long)]
    to: NaiveDate,
}

#[derive(Args, Default)]
struct FilterArgs {
    #[arg(long)]
    company: Option<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    seniority: Option<Seniority>,
    #[arg(long)]
    source: Option<String>,
    /// Substring of the job title.
    #[arg(long)]
    title: Option<String>,
    /// Comma-separated; every listed skill must be present.
    #[arg(long, value_delimiter = ',')]
    skills: Vec<String>,
}

impl WindowArgs {
    fn push_params(&self, params: &mut Vec<(&'static str, String)>) {
        params.push(("from", self.from.format("%Y-%m-%d").to_string()));
        params.push(("to", self.to.format("%Y-%m-%d").to_string()));
    }
}

impl FilterArgs {
    fn push_params(&self, params: &mut Vec<(&'static str, String)>) {
        let text = [
            ("company", &self.company),
            ("location", &self.location),
            ("source", &self.source),
            ("title", &self.title),
        ];
        for (name, value) in text {
            if let Some(v) = value {
                params.push((name, v.clone()));
            }
        }
        if let Some(level) = self.seniority {
            params.push(("seniority", level.to_string()));
        }
        if !self.skills.is_empty() {
            params.push(("skills", self.skills.join(",")));
        }
    }
}

// =============================================================================
// Rendering
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyticsBody {
    dimension: String,
    from: String,
    to: String,
    total_count: u64,
    skipped_count: u64,
    buckets: Vec<BucketBody>,
    computed_at: String,
    cached: bool,
}

#[derive(Deserialize)]
struct BucketBody {
    key: String,
    value: u64,
}

#[derive(Tabled)]
struct BucketRow {
    #[tabled(rename = "Bucket")]
    key: String,
    #[tabled(rename = "Postings")]
    value: u64,
    #[tabled(rename = "Share")]
    share: String,
}

fn bucket_rows(body: &AnalyticsBody) -> Vec<BucketRow> {
    body.buckets
        .iter()
        .map(|b| BucketRow {
            key: b.key.clone(),
            value: b.value,
            share: if body.total_count == 0 {
                "-".into()
            } else {
                format!("{:.1}%", b.value as f64 * 100.0 / body.total_count as f64)
            },
        })
        .collect()
}

fn render_analytics(body: &AnalyticsBody) -> String {
    let table = Table::new(bucket_rows(body)).with(Style::rounded()).to_string();
    format!(
        "{} [{} .. {})\n{}\ntotal {} | skipped {} | computed {}{}",
        body.dimension,
        body.from,
        body.to,
        table,
        body.total_count,
        body.skipped_count,
        body.computed_at,
        if body.cached { " (cached)" } else { "" }
    )
}

/// Pull `error.message` out of a hub error body, falling back to the raw text.
fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            let kind = v.pointer("/error/kind")?.as_str()?.to_string();
            let message = v.pointer("/error/message")?.as_str()?.to_string();
            Some(format!("{}: {}", kind, message))
        })
        .unwrap_or_else(|| body.trim().to_string());
    format!("{} {}", status, detail)
}

// =============================================================================
// HTTP
// =============================================================================

async fn send(request: reqwest::RequestBuilder) -> Result<Value, String> {
    let resp = request.send().await.map_err(|e| e.to_string())?;
    let status = resp.status();
    let text = resp.text().await.map_err(|e| e.to_string())?;
    if !status.is_success() {
        return Err(error_message(status, &text));
    }
    serde_json::from_str(&text).map_err(|e| format!("unexpected response: {}", e))
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

async fn run(command: Commands) -> Result<(), String> {
    let client = reqwest::Client::new();
    let base_url =
        std::env::var("JA_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".to_string());

    match command {
        Commands::Analytics {
            dimension,
            window,
            granularity,
            filters,
            json,
        } => {
            let mut params = Vec::new();
            window.push_params(&mut params);
            if let Some(g) = granularity {
                params.push(("granularity", g.to_string()));
            }
            filters.push_params(&mut params);

            let url = format!("{}/api/v1/analytics/{}", base_url, dimension);
            let value = send(client.get(&url).query(&params)).await?;
            if json {
                println!("{}", pretty(&value));
            } else {
                let body: AnalyticsBody = serde_json::from_value(value)
                    .map_err(|e| format!("unexpected response: {}", e))?;
                println!("{}", render_analytics(&body));
            }
        }

        Commands::Ingest { file } => {
            let content = std::fs::read_to_string(&file)
                .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
            let payload: Value = serde_json::from_str(&content)
                .map_err(|e| format!("{} is not valid JSON: {}", file.display(), e))?;
            let url = format!("{}/api/ingest", base_url);
            let outcome = send(client.post(&url).json(&payload)).await?;
            println!(
                "Accepted {} records, {} cached results invalidated",
                outcome["accepted"], outcome["invalidatedEntries"]
            );
        }

        Commands::Count { window, filters } => {
            let mut params = Vec::new();
            window.push_params(&mut params);
            filters.push_params(&mut params);
            let url = format!("{}/api/records/count", base_url);
            let value = send(client.get(&url).query(&params)).await?;
            println!("{}", pretty(&value));
        }

        Commands::Cache { action } => {
            let value = match action {
                CacheCmd::Info => send(client.get(format!("{}/api/cache/info", base_url))).await?,
                CacheCmd::Clear => {
                    send(client.post(format!("{}/api/cache/clear", base_url))).await?
                }
            };
            println!("{}", pretty(&value));
        }

        Commands::Health => {
            let value = send(client.get(format!("{}/health", base_url))).await?;
            println!("{}", pretty(&value));
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to build tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(cli.command)) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_analytics_with_filters() {
        let cli = Cli::try_parse_from([
            "ja", "analytics", "volume", "--from", "2024-01-01", "--to", "2024-02-01",
            "--granularity", "week", "--skills", "rust,go", "--seniority", "senior",
        ])
        .unwrap();
        let Commands::Analytics {
            dimension,
            window,
            granularity,
            filters,
            ..
        } = cli.command
        else {
            panic!("expected analytics");
        };
        assert_eq!(dimension, Dimension::Volume);
        assert_eq!(granularity, Some(Granularity::Week));

        let mut params = Vec::new();
        window.push_params(&mut params);
        filters.push_params(&mut params);
        assert_eq!(
            params,
            vec![
                ("from", "2024-01-01".to_string()),
                ("to", "2024-02-01".to_string()),
                ("seniority", "senior".to_string()),
                ("skills", "rust,go".to_string()),
            ]
        );
    }

    #[test]
    fn test_cli_rejects_unknown_dimension_and_bad_dates() {
        assert!(Cli::try_parse_from(["ja", "analytics", "salaries", "--from", "2024-01-01", "--to", "2024-02-01"]).is_err());
        assert!(Cli::try_parse_from(["ja", "count", "--from", "yesterday", "--to", "2024-02-01"]).is_err());
    }

    #[test]
    fn test_render_shares() {
        let body: AnalyticsBody = serde_json::from_value(serde_json::json!({
            "dimension": "seniority", "from": "2024-01-01", "to": "2024-02-01",
            "totalCount": 4, "skippedCount": 0, "computedAt": "2024-02-01T00:00:00Z",
            "cached": true,
            "buckets": [{"key": "senior", "value": 3}, {"key": "unknown", "value": 1}]
        }))
        .unwrap();
        let rows = bucket_rows(&body);
        assert_eq!(rows[0].share, "75.0%");
        let text = render_analytics(&body);
        assert!(text.contains("senior"));
        assert!(text.ends_with("(cached)"));
    }

    #[test]
    fn test_error_message_prefers_structured_body() {
        let body = r#"{"error": {"kind": "invalid_window", "message": "start after end"}}"#;
        let msg = error_message(reqwest::StatusCode::BAD_REQUEST, body);
        assert_eq!(msg, "400 Bad Request invalid_window: start after end");
        let msg = error_message(reqwest::StatusCode::BAD_GATEWAY, "upstream down\n");
        assert_eq!(msg, "502 Bad Gateway upstream down");
    }
}
