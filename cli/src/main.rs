//! failoverctl: operator CLI for the CARP failover daemon
//!
//! Talks to the daemon's HTTP status surface.

use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "failoverctl", version, about = "CARP failover daemon CLI")]
struct Cli {
    /// Daemon HTTP URL
    #[arg(long, default_value = "http://localhost:6080", global = true, env = "FAILOVER_URL")]
    url: String,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, clap::ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show failover status, pool ownership and whether an event is running
    Status {
        /// Recompute instead of reading the cached value
        #[arg(long)]
        refresh: bool,
    },
    /// Inject a CARP notification, e.g. `event 10@em0 MASTER`
    Event {
        /// `<vhid>@<ifname>`
        subsystem: String,
        /// MASTER, BACKUP or INIT
        #[arg(value_name = "TYPE")]
        kind: String,
    },
    /// Take over from the other controller
    ForceMaster,
    /// Is a promotion or demotion running?
    InProgress,
}

struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> Result<Value, Box<dyn std::error::Error>> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Result<Value, Box<dyn std::error::Error>> {
        let mut request = self.http.post(format!("{}{}", self.base_url, path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        Self::decode(request.send().await?).await
    }

    async fn decode(response: reqwest::Response) -> Result<Value, Box<dyn std::error::Error>> {
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            let reason = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            return Err(format!("{}: {}", status, reason).into());
        }
        Ok(body)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = Client::new(&cli.url);

    let result = match cli.command {
        Commands::Status { refresh } => run_status(&client, refresh, &cli.format).await,
        Commands::Event { subsystem, kind } => {
            run_event(&client, &subsystem, &kind, &cli.format).await
        }
        Commands::ForceMaster => run_force_master(&client, &cli.format).await,
        Commands::InProgress => run_in_progress(&client).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run_status(
    client: &Client,
    refresh: bool,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = if refresh {
        client.post("/api/failover/status/refresh", None).await?
    } else {
        client.get("/api/failover/status").await?
    };
    let pools = client.get("/api/failover/pools").await?;
    let in_progress = client.get("/api/failover/in_progress").await?;

    let summary = json!({
        "status": status["status"],
        "pools_imported": pools["imported"],
        "in_progress": in_progress["in_progress"],
    });
    print_value(&summary, format)
}

async fn run_event(
    client: &Client,
    subsystem: &str,
    kind: &str,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let body = json!({ "subsystem": subsystem, "type": kind });
    let accepted = client.post("/api/failover/event", Some(body)).await?;
    print_value(&accepted, format)
}

async fn run_force_master(
    client: &Client,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = client.post("/api/failover/force_master", None).await?;
    print_value(&result, format)
}

async fn run_in_progress(client: &Client) -> Result<(), Box<dyn std::error::Error>> {
    let body = client.get("/api/failover/in_progress").await?;
    let running = body["in_progress"].as_bool().unwrap_or(false);
    println!("{}", if running { "yes" } else { "no" });
    Ok(())
}

fn print_value(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Table => {
            let Some(map) = value.as_object() else {
                println!("{}", format_table_value(value));
                return Ok(());
            };
            let mut table = Table::new();
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["Field", "Value"]);
            for (key, v) in map {
                table.add_row(vec![key.clone(), format_table_value(v)]);
            }
            println!("{}", table);
        }
    }
    Ok(())
}

fn format_table_value(v: &Value) -> String {
    match v {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Object(_) | Value::Array(_) => serde_json::to_string(v).unwrap_or_default(),
    }
}
