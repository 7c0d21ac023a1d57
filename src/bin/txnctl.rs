use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "txnctl")]
#[command(about = "Inspect a running txn-proxy through its admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    url: String,

    #[arg(short, long, default_value = "admin-secret-key")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Uptime, live sessions and transactions
    Status,
    /// Transactions in flight, oldest first
    Transactions {
        /// Only show transactions in this state (e.g. connecting_origin)
        #[arg(long)]
        state: Option<String>,
    },
    /// Origin session pool counters
    Sessions,
    /// Per-address origin health
    Upstreams {
        /// Only show addresses currently marked down
        #[arg(long)]
        down: bool,
    },
    /// Cache configuration and counters
    Cache,
}

impl Commands {
    fn path(&self) -> &'static str {
        match self {
            Commands::Status => "/admin/status",
            Commands::Transactions { .. } => "/admin/transactions",
            Commands::Sessions => "/admin/sessions",
            Commands::Upstreams { .. } => "/admin/upstreams",
            Commands::Cache => "/admin/cache",
        }
    }

    /// Client-side filtering of list views.
    fn filter(&self, json: Value) -> Value {
        match (self, json) {
            (Commands::Transactions { state: Some(state) }, Value::Array(items)) => Value::Array(
                items
                    .into_iter()
                    .filter(|t| t["state"].as_str() == Some(state.as_str()))
                    .collect(),
            ),
            (Commands::Upstreams { down: true }, Value::Array(items)) => Value::Array(
                items
                    .into_iter()
                    .filter(|u| u["down"].as_bool() == Some(true))
                    .collect(),
            ),
            (_, json) => json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let url = format!("{}{}", cli.url.trim_end_matches('/'), cli.command.path());
    let res = client.get(url).headers(headers).send().await?;

    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            if !text.is_empty() {
                eprintln!("Response: {}", text);
            }
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    let json = cli.command.filter(json);
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
