// Scanbridge daemon: scanner discovery, file reception, optional proxy
// forwarding.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use scanbridge_agent::agent::Agent;
use scanbridge_agent::{config, netif};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("scanbridge {} — legacy scanner bridge agent", VERSION);
    println!();
    println!("USAGE:");
    println!("    scanbridge [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print this help message and exit");
    println!("    -V, --version    Print version and exit");
    println!();
    println!("DESCRIPTION:");
    println!("    Answers scanner discovery broadcasts, acknowledges transfer");
    println!("    requests, and receives scanned files over raw TCP. Files are");
    println!("    kept in the configured directory, or forwarded to a downstream");
    println!("    agent when proxy mode is enabled.");
    println!();
    println!("    Control     UDP 706   (discovery + transfer negotiation)");
    println!("    Data        TCP 708   (raw file bytes)");
    println!();
    println!("    Stop with Ctrl+C or SIGTERM.");
    println!();
    println!("CONFIGURATION:");
    println!("    Config file (optional, first found wins):");
    println!("      ~/.config/scanbridge/config.toml");
    println!("      /etc/scanbridge/config.toml");
    println!();
    println!("    Example config.toml:");
    println!("      [network]");
    println!("      udp_port = 706");
    println!("      tcp_port = 708");
    println!();
    println!("      [scanner]");
    println!("      default_src_name = \"Agent\"");
    println!("      files_directory = \"files\"");
    println!("      max_files_retention = 10");
    println!();
    println!("      [proxy]");
    println!("      enabled = false");
    println!();
    println!("ENVIRONMENT VARIABLES (override config file):");
    println!("    SCANBRIDGE_UDP_PORT      Control port (default: 706)");
    println!("    SCANBRIDGE_TCP_PORT      Data port (default: 708)");
    println!("    SCANBRIDGE_FILES_DIR     Store directory (default: files)");
    println!("    SCANBRIDGE_AGENT_NAME    Agent name (default: Agent)");
    println!("    SCANBRIDGE_PROXY_IP      Downstream agent; enables proxy mode");
    println!("    RUST_LOG                 Log filter (default: info)");
}

fn main() {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("scanbridge {}", VERSION);
                return;
            }
            "--help" | "-h" => {
                print_help();
                return;
            }
            other => {
                eprintln!("scanbridge: unknown option '{}'\n", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cfg = config::load();
    let iface = match netif::probe() {
        Ok(iface) => iface,
        Err(e) => {
            error!("cannot resolve network interface: {}", e);
            std::process::exit(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("cannot start runtime: {}", e);
            std::process::exit(1);
        }
    };
    let code = rt.block_on(async {
        let agent = match Agent::start(cfg, iface).await {
            Ok(agent) => agent,
            Err(e) => {
                error!("startup failed: {}", e);
                return 1;
            }
        };
        info!("scanbridge {} running", VERSION);
        if let Err(e) = shutdown_signal().await {
            error!("signal handling failed: {}", e);
        }
        agent.shutdown().await;
        0
    });
    std::process::exit(code);
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
