mod pipe;

use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};

use crate::pipe::tunnel::{client::ClientOptions, splice::DEFAULT_BUFFER_SIZE};

#[derive(Debug, Parser)]
#[command(
    name = "pipe",
    version,
    about = "pipe - expose a local TCP service through a public relay server"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public relay server.
    Server {
        /// Path to a config file (.toml/.yaml/.yml). If omitted, uses PIPE_CONFIG; then pipe.toml > pipe.yaml > pipe.yml from CWD; then flags and defaults.
        #[arg(short, long, env = "PIPE_CONFIG")]
        config: Option<PathBuf>,

        /// Main listening port (control and data connections). Overrides the config file.
        #[arg(short, long)]
        port: Option<u16>,

        /// Admin HTTP port; 0 disables it. Overrides the config file.
        #[arg(short, long)]
        admin_port: Option<u16>,
    },

    /// Expose a local service through a relay server.
    Client {
        /// Relay server address, e.g. relay.example.com:8910.
        #[arg(short, long)]
        server: String,

        /// Local service to forward inbound connections to.
        #[arg(short, long)]
        local: String,

        /// Public port to open on the server.
        #[arg(short, long)]
        remote_port: u16,

        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        dial_timeout: Duration,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server {
            config,
            port,
            admin_port,
        } => pipe::run_server(config, port, admin_port).await,
        Command::Client {
            server,
            local,
            remote_port,
            dial_timeout,
        } => {
            pipe::run_client(ClientOptions {
                server_addr: server,
                local_addr: local,
                remote_port,
                dial_timeout,
                buffer_size: DEFAULT_BUFFER_SIZE,
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_client_flags() {
        let cli = Cli::try_parse_from([
            "pipe", "client", "-s", "relay:8910", "-l", "127.0.0.1:3000", "-r", "9000",
        ])
        .unwrap();
        match cli.command {
            Command::Client {
                remote_port,
                dial_timeout,
                ..
            } => {
                assert_eq!(remote_port, 9000);
                assert_eq!(dial_timeout, Duration::from_secs(5));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
