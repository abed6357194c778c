use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rdmapipe-bench")]
#[command(about = "Ping-pong benchmark for rdmapipe transports", long_about = None)]
pub struct Cli {
    /// TOML or JSON transport config; defaults apply to missing keys.
    #[arg(short, long, env = "RDMAPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "rdma")]
    pub transport: TransportChoice,

    /// Round trips per connection.
    #[arg(long, default_value = "100000")]
    pub messages: u64,

    /// Payload bytes per message.
    #[arg(long, default_value = "64")]
    pub size: usize,

    #[command(subcommand)]
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportChoice {
    /// Wraparound ring written with one-sided RDMA writes, one client.
    Rdma,
    /// Per-client slots behind one server.
    Multiclient,
    /// Rings in a shared-memory file, same host only.
    Shm,
}

#[derive(Subcommand, Debug)]
pub enum Role {
    /// Accept connections and echo every message back.
    Server {
        #[arg(long, default_value = "0.0.0.0:18515")]
        listen: String,
        /// Connections to accept before the clock starts.
        #[arg(long, default_value = "1")]
        clients: usize,
        /// Shared-memory segment name.
        #[arg(long, default_value = "bench")]
        name: String,
    },
    /// Connect, send, and time the echoes.
    Client {
        #[arg(long, default_value = "127.0.0.1:18515")]
        server: String,
        /// Connections opened from this process, each with its own context and thread.
        #[arg(long, default_value = "1")]
        nodes: usize,
        #[arg(long, default_value = "bench")]
        name: String,
    },
    /// Run server and clients in this process on the simulated fabric.
    Local {
        #[arg(long, default_value = "1")]
        clients: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client() {
        let cli = Cli::try_parse_from([
            "rdmapipe-bench",
            "--transport",
            "multiclient",
            "--size",
            "512",
            "client",
            "--server",
            "10.0.0.1:18515",
            "--nodes",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.transport, TransportChoice::Multiclient);
        assert_eq!(cli.size, 512);
        assert_eq!(cli.messages, 100000);
        match cli.role {
            Role::Client { server, nodes, .. } => {
                assert_eq!(server, "10.0.0.1:18515");
                assert_eq!(nodes, 4);
            }
            other => panic!("unexpected role {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_transport() {
        assert!(Cli::try_parse_from(["rdmapipe-bench", "--transport", "tcp", "local"]).is_err());
    }
}
