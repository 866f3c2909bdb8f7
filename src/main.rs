use std::path::PathBuf;

use fofa_view_rs::client::{cert_query_for_host, FofaClient};
use fofa_view_rs::config::{load_config_or_default, FofaConfig};
use fofa_view_rs::query::{cert_query_from_hex, SearchRequest};
use fofa_view_rs::server;
use fofa_view_rs::session::{ExportFormat, Session};
use fofa_view_rs::types::{AdditionalField, Record};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// fofa-view-rs: FOFA search client that paginates, deduplicates and exports asset results.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "fofa-view-rs",
    version,
    about = "FOFA search client that paginates, deduplicates and exports asset results.",
    long_about = None
)]
struct Cli {
    /// FOFA query, e.g. 'app="nginx" && country="DE"'.
    query: Option<String>,

    /// Properties file with api, key, max_size, fields and proxy settings.
    #[arg(long, default_value = "config.properties")]
    config: PathBuf,

    /// API key (overrides the config file).
    #[arg(long)]
    key: Option<String>,

    /// API base URL (overrides the config file).
    #[arg(long)]
    api: Option<String>,

    /// Rows requested per page.
    #[arg(long)]
    size: Option<u64>,

    /// Stop once this many distinct records were collected.
    #[arg(long)]
    max: Option<u64>,

    /// Additional field to request; repeat for several (fid, os, icp, product,
    /// certs_subject_cn, certs_subject_org, lastupdatetime).
    #[arg(long = "field")]
    fields: Vec<AdditionalField>,

    /// Match all historical data, not only the last year.
    #[arg(long, default_value_t = false)]
    full: bool,

    /// Exclude honeypot and fraud results.
    #[arg(long = "exclude-honeypot", default_value_t = false)]
    exclude_honeypot: bool,

    /// Load at most this many pages (default: until exhausted).
    #[arg(long)]
    pages: Option<u32>,

    /// Export results to this spreadsheet path.
    #[arg(long)]
    xlsx: Option<PathBuf>,

    /// Export normalized URLs, one per line, to this path.
    #[arg(long)]
    txt: Option<PathBuf>,

    /// Search by certificate serial (hex, as shown by browsers or openssl).
    #[arg(long, group = "pivot", conflicts_with = "query")]
    cert: Option<String>,

    /// Search by the serial of the certificate served on this host[:port].
    #[arg(long = "cert-host", group = "pivot", conflicts_with = "query")]
    cert_host: Option<String>,

    /// Search by the favicon hash of this site URL.
    #[arg(long, group = "pivot", conflicts_with = "query")]
    favicon: Option<String>,

    /// Serve the JSON session API on this address instead of running a query.
    #[arg(long)]
    serve: Option<String>,

    /// Directory that exports requested over the API are written under.
    #[arg(long = "export-dir", default_value = ".")]
    export_dir: PathBuf,

    /// Print the remaining account quota and exit.
    #[arg(long, default_value_t = false)]
    quota: bool,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = effective_config(&cli)?;
    let client = FofaClient::new(&config).context("failed to build HTTP client")?;

    if cli.quota {
        let q = client.account_quota(&config).await?;
        println!(
            "remaining queries: {}  remaining data: {}",
            q.remain_api_query, q.remain_api_data
        );
        return Ok(());
    }

    if let Some(bind) = cli.serve.as_deref() {
        println!("Press Ctrl+C to stop the server...");
        tokio::select! {
            res = server::spawn_server(bind, client, config, cli.export_dir.clone()) => res?,
            _ = tokio::signal::ctrl_c() => {}
        }
        return Ok(());
    }

    let pivot = pivot_query(&cli, &client).await?;
    if let Some(q) = &pivot {
        println!("pivot query: {q}");
    }
    let Some(query) = pivot
        .as_deref()
        .or(cli.query.as_deref())
        .map(str::trim)
        .filter(|q| !q.is_empty())
    else {
        bail!("no query given (pass a query, --cert, --cert-host or --favicon, or use --serve / --quota)");
    };
    if config.key.is_empty() {
        warn!("no API key configured; the API will most likely reject the request");
    }

    let request = SearchRequest {
        query: query.to_string(),
        full: cli.full,
        exclude_honeypot: cli.exclude_honeypot,
    };
    println!("fofa-view-rs query:");
    println!("  query        : {}", request.effective_query());
    println!("  page size    : {}", config.page_size);
    println!("  max records  : {}", config.max_records);
    println!(
        "  fields       : {}",
        config
            .additional_fields
            .iter()
            .map(|f| f.api_name())
            .collect::<Vec<_>>()
            .join(",")
    );

    let mut session: Session<Record> = Session::new(request, config);
    let cancel = session.cancel_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel.cancel();
    });

    if let Err(e) = session.run(&client, cli.pages).await {
        eprintln!("Warning: stopped early: {e}");
    }
    print_results_table(&session);

    if let Some(path) = cli.xlsx.as_deref() {
        report(session.export(ExportFormat::Xlsx, path));
    }
    if let Some(path) = cli.txt.as_deref() {
        report(session.export(ExportFormat::Txt, path));
    }

    Ok(())
}

async fn pivot_query(cli: &Cli, client: &FofaClient) -> Result<Option<String>> {
    if let Some(serial) = &cli.cert {
        return Ok(Some(cert_query_from_hex(serial)?));
    }
    if let Some(host) = &cli.cert_host {
        let q = cert_query_for_host(host)
            .await
            .with_context(|| format!("failed to read certificate of {host}"))?;
        return Ok(Some(q));
    }
    if let Some(url) = &cli.favicon {
        let q = client
            .favicon_query(url)
            .await
            .with_context(|| format!("failed to hash favicon of {url}"))?;
        return Ok(Some(q));
    }
    Ok(None)
}

fn effective_config(cli: &Cli) -> Result<FofaConfig> {
    let mut config = load_config_or_default(&cli.config)
        .with_context(|| format!("failed to load config: {}", cli.config.display()))?;
    if let Some(key) = &cli.key {
        config.key = key.clone();
    }
    if let Some(api) = &cli.api {
        config.api = api.trim_end_matches('/').to_string();
    }
    if let Some(size) = cli.size {
        if size == 0 {
            bail!("--size must be positive");
        }
        config.page_size = size;
    }
    if let Some(max) = cli.max {
        config.max_records = max;
    }
    if !cli.fields.is_empty() {
        config.additional_fields = cli.fields.clone();
    }
    Ok(config)
}

fn report(outcome: fofa_view_rs::export::ExportOutcome) {
    if outcome.success {
        println!("{}", outcome.message);
    } else {
        eprintln!("{}", outcome.message);
    }
}

fn print_results_table(session: &Session<Record>) {
    let records = session.records();
    let fields = &session.config().additional_fields;

    let mut host_w = "host".len();
    let mut title_w = "title".len();
    let mut ip_w = "ip".len();
    for r in records {
        host_w = host_w.max(r.service.host.len().min(50));
        title_w = title_w.max(r.service.title.chars().count().min(40));
        ip_w = ip_w.max(r.service.ip.len());
    }
    let seq_w = records.len().to_string().len().max(1);
    let port_w = 5usize;

    let state = session.state();
    println!(
        "\nRecords: {} (server total: {}, more: {})",
        records.len(),
        state.total,
        session.has_more()
    );
    print!(
        "{:>seq_w$}  {:<host_w$}  {:<title_w$}  {:<ip_w$}  {:>port_w$}  {:<8}",
        "#", "host", "title", "ip", "port", "protocol"
    );
    for f in fields {
        print!("  {}", f.header());
    }
    println!();
    for r in records {
        let s = &r.service;
        print!(
            "{:>seq_w$}  {:<host_w$}  {:<title_w$}  {:<ip_w$}  {:>port_w$}  {:<8}",
            r.sequence,
            truncate(&s.host, 50),
            truncate(&s.title, 40),
            s.ip,
            s.port,
            s.protocol
        );
        for f in fields {
            print!("  {}", s.extras.get(*f));
        }
        println!();
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
