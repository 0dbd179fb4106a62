use clap::Parser;
use swivel::config::ProxyConfig;

#[derive(Parser)]
#[command(name = "swivel", about = "Reverse proxy with protocol-switch tunneling")]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Origin base URI to proxy to
    #[arg(short, long)]
    target: Option<String>,

    /// Set an origin request header (format: "name: value", repeatable)
    #[arg(long = "set-header")]
    set_headers: Vec<String>,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("swivel=info"));
    let span_events = tracing_subscriber::fmt::format::FmtSpan::CLOSE;
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_span_events(span_events)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_span_events(span_events)
            .init();
    }

    // Load config file or start with defaults
    let mut config = if let Some(ref path) = cli.config {
        ProxyConfig::from_toml_file(path)?
    } else {
        ProxyConfig::default()
    };

    // CLI overrides for global settings
    if let Some(target) = cli.target {
        config.target = Some(target);
    }
    if config.listen.is_none() {
        config.listen = Some(cli.listen.clone());
    }

    for header in &cli.set_headers {
        let (name, value) = parse_header_arg(header)?;
        config.headers.entry(name).or_default().push(value);
    }

    let listen = config.listen.clone().unwrap_or(cli.listen);
    let proxy = config.into_builder()?.build()?;
    proxy
        .listen_with_shutdown(listen.as_str(), async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
}

fn parse_header_arg(s: &str) -> anyhow::Result<(String, String)> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("header must be 'name: value', got '{s}'"))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}
