use anyhow::Result;
use clap::{value_parser, Arg, ArgMatches, Command};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use zerodb::{config::ServerConfig, server::run_until_shutdown};

/// Main entry point for the zerodb server.
///
/// 1. Loads the JSON configuration file (defaults when it is missing)
/// 2. Applies command-line overrides
/// 3. Initializes structured logging, `RUST_LOG` first, then `log_level`
/// 4. Runs the server until Ctrl-C or SIGTERM
///
/// # Arguments
/// - `--config FILE`: configuration file (default: zerodb.json)
/// - `--host HOST`, `--port PORT`: listen address
/// - `--storage PATH`: data directory, or `:memory:`
/// - `--max-connections N`: concurrent client limit
#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("zerodb")
        .about("Tiny MySQL-wire-compatible server with idle resource release")
        .arg(Arg::new("config")
            .long("config")
            .value_name("FILE")
            .default_value("zerodb.json")
            .help("JSON configuration file; missing keys take defaults"))
        .arg(Arg::new("host")
            .long("host")
            .value_name("HOST")
            .help("Interface to bind"))
        .arg(Arg::new("port")
            .long("port")
            .value_name("PORT")
            .value_parser(value_parser!(u16))
            .help("TCP port to listen on"))
        .arg(Arg::new("storage")
            .long("storage")
            .value_name("PATH")
            .help("Data directory, or :memory: for a volatile store"))
        .arg(Arg::new("max-connections")
            .long("max-connections")
            .value_name("N")
            .value_parser(value_parser!(usize))
            .help("Maximum concurrent clients"))
        .get_matches();

    let config = load_config(&matches)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    info!(?config, "starting zerodb");
    run_until_shutdown(config).await
}

fn load_config(matches: &ArgMatches) -> Result<ServerConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = matches.get_one::<String>("host") {
        config.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }
    if let Some(storage) = matches.get_one::<String>("storage") {
        config.storage_path = storage.clone();
    }
    if let Some(max) = matches.get_one::<usize>("max-connections") {
        config.max_connections = *max;
    }
    Ok(config)
}
