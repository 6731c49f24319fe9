//! Burrow - tunnels TCP byte streams over HTTP-friendly carriers.
//!
//! This is the binary entry point. See the `burrow` library for the
//! tunnel itself.

use anyhow::Result;
use burrow::{crypto, Client, ClientConfig, Server, ServerConfig};
use clap::Parser;
use mimalloc::MiMalloc;

/// mimalloc outperforms the system allocator under the many small frame
/// allocations the relay loops make.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "burrow")]
#[command(version)]
#[command(about = "Tunnels TCP over HTTP(S)/WebSocket, with transparent session resume")]
#[command(after_help = "[S]: server side flag. [C]: client side flag.")]
struct Cli {
    /// Run as server. [S]
    #[arg(short = 's', long)]
    server: bool,

    /// Run as client. [C]
    #[arg(short = 'c', long)]
    client: bool,

    /// Listen address: admissions for the server, local TCP for the
    /// client (stdio when omitted). [SC]
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Server endpoint, e.g. wss://host/path or https://host/path. [C]
    #[arg(short = 'e', long)]
    endpoint: Option<String>,

    /// Destination address to connect to, host:port. [C]
    #[arg(short = 'd', long)]
    destination: Option<String>,

    /// Shared token between client and server. [SC]
    #[arg(short = 't', long, default_value = "")]
    token: String,

    /// Keyed mode: the server's private key [S] or public key [C],
    /// base64. Replaces the token for the Upgrade variant.
    #[arg(short = 'k', long)]
    key: Option<String>,

    /// Use this User-Agent instead of the HTTP client default. [C]
    #[arg(long)]
    user_agent: Option<String>,

    /// Generate a keypair for keyed mode and exit.
    #[arg(long)]
    keygen: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    if cli.keygen {
        let keypair = crypto::Keypair::generate();
        println!("private: {}", keypair.private_str());
        println!("public:  {}", keypair.public_str());
        return Ok(());
    }

    if cli.server == cli.client {
        anyhow::bail!("exactly one of --server and --client is required (see --help)");
    }

    if cli.server {
        let listen = cli
            .listen
            .ok_or_else(|| anyhow::anyhow!("--listen is required for the server"))?;
        if cli.token.is_empty() && cli.key.is_none() {
            anyhow::bail!("the server needs --token or --key");
        }

        let server = Server::new(ServerConfig::new(listen.clone(), cli.token, cli.key))?;
        let listener = tokio::net::TcpListener::bind(&listen)
            .await
            .map_err(|e| anyhow::anyhow!("failed to listen on {listen}: {e}"))?;

        tokio::select! {
            result = server.serve(listener) => result,
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, shutting down");
                Ok(())
            }
        }
    } else {
        let endpoint = cli
            .endpoint
            .ok_or_else(|| anyhow::anyhow!("--endpoint is required for the client"))?;
        let destination = cli
            .destination
            .ok_or_else(|| anyhow::anyhow!("--destination is required for the client"))?;

        let config = ClientConfig {
            endpoint,
            token: cli.token,
            key: cli.key,
            destination,
            listen: cli.listen,
            user_agent: cli.user_agent,
        };
        if config.key.is_some() && config.is_resumable() {
            anyhow::bail!("keyed mode applies to http(s) endpoints; use --token with ws(s)");
        }

        let client = Client::new(config);
        tokio::select! {
            result = client.run() => result,
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, shutting down");
                Ok(())
            }
        }
    }
}
