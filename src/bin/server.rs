//! MTProxy Server Binary
//!
//! Usage: mtproxy-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Path to configuration file
//!   -g, --generate            Generate new server configuration
//!   -l, --link <FILE> <HOST>  Print the client link for a configuration
//!   -h, --help                Print help information

use std::env;

use mtproxy::server::{Server, ServerConfig, ServerConfigFile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_server(&args[2]).await?;
        }
        "-l" | "--link" => {
            if args.len() < 4 {
                eprintln!("Error: --link requires a config file path and a public host");
                return Ok(());
            }
            show_link(&args[2], &args[3])?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"MTProxy Server - obfuscated-handshake relay proxy

USAGE:
    mtproxy-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>         Path to configuration file
    -g, --generate              Generate new server configuration
    -l, --link <FILE> <HOST>    Print the client link for a configuration
    -h, --help                  Print help information

ENVIRONMENT:
    MTPROXY_HOST, MTPROXY_PORT, MTPROXY_SECRET, MTPROXY_TIMEOUT
                                Override the matching configuration values
    RUST_LOG                    Log filter (default: info)

EXAMPLES:
    Generate a new configuration:
        mtproxy-server --generate > mtproxy.toml

    Run the server:
        mtproxy-server --config mtproxy.toml

    Show the link to share with clients:
        mtproxy-server --link mtproxy.toml 203.0.113.7
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config = ServerConfig::new_random();
    let config_file = ServerConfigFile::from_config(&config);

    println!("# MTProxy Server Configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", toml::to_string_pretty(&config_file)?);
    println!("# Client link (replace YOUR_SERVER_IP):");
    println!("# {}", config.proxy_link("YOUR_SERVER_IP"));

    Ok(())
}

fn load_config(config_path: &str) -> anyhow::Result<ServerConfig> {
    let mut config = ServerConfig::load(config_path)?;
    config.apply_process_env()?;
    config.validate()?;
    Ok(config)
}

fn show_link(config_path: &str, host: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    println!("{}", config.proxy_link(host));
    Ok(())
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    tracing::info!("Starting MTProxy server on {}", config.bind_addr());
    tracing::info!("Secret: {:?}", config.secret);
    tracing::info!(
        "Limits: {} connections per IP, {} per {}s",
        config.max_connections_per_ip,
        config.rate_limit.max_connections,
        config.rate_limit.window.as_secs()
    );

    let server = Server::new(config)?;

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_server.shutdown();
        }
    });

    server.run().await?;

    println!("{}", server.admin().report());
    Ok(())
}
