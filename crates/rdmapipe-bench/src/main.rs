#![warn(missing_docs)]

//! rdmapipe ping-pong benchmark

mod cli;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rdmapipe_transport::shm::shm_path;
use rdmapipe_transport::{
    MulticlientClient, MulticlientServer, NetworkConfig, NetworkContext, RdmaTransport,
    ShmTransport, SimNetwork, TcpBootstrap, Transport, TransportConfig, TransportError,
};
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Role, TransportChoice};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => TransportConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TransportConfig::default(),
    };
    if cli.size == 0 {
        bail!("--size must be at least 1");
    }
    info!(
        transport = ?cli.transport,
        size = cli.size,
        messages = cli.messages,
        "rdmapipe bench starting"
    );

    let bench = Bench {
        config,
        choice: cli.transport,
        messages: cli.messages,
        size: cli.size,
    };
    let report = match cli.role {
        Role::Server {
            listen,
            clients,
            name,
        } => bench.server(&Devices::hardware()?, &listen, clients, &name).await?,
        Role::Client {
            server,
            nodes,
            name,
        } => bench.clients(Devices::hardware()?, &server, nodes, &name)?,
        Role::Local { clients } => bench.local(clients).await?,
    };
    report.print();
    Ok(())
}

/// Where contexts come from.
#[derive(Clone)]
enum Devices {
    Sim(SimNetwork),
    #[cfg(feature = "verbs")]
    Verbs,
}

impl Devices {
    #[cfg(feature = "verbs")]
    fn hardware() -> Result<Self> {
        Ok(Devices::Verbs)
    }

    #[cfg(not(feature = "verbs"))]
    fn hardware() -> Result<Self> {
        bail!("built without the `verbs` feature; use the `local` role for the simulated fabric")
    }

    fn open(&self, config: &NetworkConfig) -> Result<NetworkContext> {
        let ctx = match self {
            Devices::Sim(net) => NetworkContext::open(net.device(), config.clone())?,
            #[cfg(feature = "verbs")]
            Devices::Verbs => NetworkContext::open_device(config.clone())?,
        };
        Ok(ctx)
    }
}

struct Report {
    role: &'static str,
    connections: usize,
    messages: u64,
    bytes: u64,
    elapsed: Duration,
}

impl Report {
    fn merge(role: &'static str, parts: Vec<Report>) -> Report {
        Report {
            role,
            connections: parts.iter().map(|r| r.connections).sum(),
            messages: parts.iter().map(|r| r.messages).sum(),
            bytes: parts.iter().map(|r| r.bytes).sum(),
            elapsed: parts.iter().map(|r| r.elapsed).max().unwrap_or_default(),
        }
    }

    fn print(&self) {
        let secs = self.elapsed.as_secs_f64().max(f64::EPSILON);
        println!(
            "{}: {} connections, {} messages in {:.3}s, {:.0} messages/s, {:.2} MiB/s",
            self.role,
            self.connections,
            self.messages,
            secs,
            self.messages as f64 / secs,
            self.bytes as f64 / secs / (1024.0 * 1024.0),
        );
    }
}

struct Bench {
    config: TransportConfig,
    choice: TransportChoice,
    messages: u64,
    size: usize,
}

impl Bench {
    async fn server(
        &self,
        devices: &Devices,
        listen: &str,
        clients: usize,
        name: &str,
    ) -> Result<Report> {
        if self.choice == TransportChoice::Shm {
            let mut shm = ShmTransport::create(shm_path(name), &self.config.ring)?;
            info!(path = %shm.path().display(), "waiting for shared-memory client");
            return echo(&mut shm, self.messages);
        }
        let boot = TcpBootstrap::new(self.config.bootstrap.clone());
        let listener = boot.listen(listen).await?;
        self.serve(devices, &boot, &listener, clients).await
    }

    async fn serve(
        &self,
        devices: &Devices,
        boot: &TcpBootstrap,
        listener: &TcpListener,
        clients: usize,
    ) -> Result<Report> {
        let ctx = devices.open(&self.config.network)?;
        let report = match self.choice {
            TransportChoice::Rdma => {
                if clients != 1 {
                    bail!("the rdma ring pairs exactly one client; use --transport multiclient");
                }
                let (mut stream, peer) = boot.accept(listener).await?;
                let mut transport =
                    RdmaTransport::connect(&ctx, &mut stream, &self.config.ring).await?;
                info!(%peer, "ring client connected");
                echo(&mut transport, self.messages)?
            }
            TransportChoice::Multiclient => {
                let mut server = MulticlientServer::new(&ctx, &self.config.multiclient)?;
                for _ in 0..clients {
                    let (stream, peer) = boot.accept(listener).await?;
                    let index = server.accept(stream).await?;
                    info!(%peer, index, "multiclient client accepted");
                }
                let total = clients as u64 * self.messages;
                let start = Instant::now();
                let mut bytes = 0;
                for _ in 0..total {
                    let (client, request) = server.receive()?;
                    bytes += request.len() as u64;
                    server.respond(client, &request)?;
                }
                Report {
                    role: "server",
                    connections: clients,
                    messages: total,
                    bytes,
                    elapsed: start.elapsed(),
                }
            }
            TransportChoice::Shm => bail!("shared memory has no network server"),
        };
        debug!(metrics = %serde_json::to_string(&ctx.metrics().snapshot())?, "server metrics");
        Ok(report)
    }

    /// Runs `nodes` client connections, one thread each, and merges their reports.
    fn clients(&self, devices: Devices, server: &str, nodes: usize, name: &str) -> Result<Report> {
        if self.choice == TransportChoice::Shm {
            if nodes != 1 {
                bail!("a shared-memory segment carries one client");
            }
            let mut shm = self.open_shm(name)?;
            return ping(&mut shm, self.messages, self.size);
        }
        let handles: Vec<_> = (0..nodes)
            .map(|_| {
                let devices = devices.clone();
                let server = server.to_string();
                let config = self.config.clone();
                let (choice, messages, size) = (self.choice, self.messages, self.size);
                thread::spawn(move || {
                    run_client(&devices, &config, choice, &server, messages, size)
                })
            })
            .collect();
        let mut parts = Vec::with_capacity(nodes);
        for handle in handles {
            match handle.join() {
                Ok(report) => parts.push(report?),
                Err(_) => bail!("client thread panicked"),
            }
        }
        Ok(Report::merge("client", parts))
    }

    async fn local(&self, clients: usize) -> Result<Report> {
        if self.choice == TransportChoice::Shm {
            let name = format!("bench-{}", std::process::id());
            let mut server = ShmTransport::create(shm_path(&name), &self.config.ring)?;
            let mut client = ShmTransport::open(shm_path(&name), &self.config.ring)?;
            let (messages, size) = (self.messages, self.size);
            let pinger = thread::spawn(move || ping(&mut client, messages, size));
            echo(&mut server, self.messages)?;
            return match pinger.join() {
                Ok(report) => report,
                Err(_) => bail!("client thread panicked"),
            };
        }
        let devices = Devices::Sim(SimNetwork::new());
        let boot = TcpBootstrap::new(self.config.bootstrap.clone());
        let listener = boot.listen("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();

        let client = {
            let devices = devices.clone();
            let config = self.config.clone();
            let (choice, messages, size) = (self.choice, self.messages, self.size);
            thread::spawn(move || {
                let bench = Bench {
                    config,
                    choice,
                    messages,
                    size,
                };
                bench.clients(devices, &addr, clients, "")
            })
        };
        let served = self.serve(&devices, &boot, &listener, clients).await?;
        debug!(messages = served.messages, "local server done");
        match client.join() {
            Ok(report) => report,
            Err(_) => bail!("client thread panicked"),
        }
    }

    /// Opens the segment a server created, waiting for it to appear.
    fn open_shm(&self, name: &str) -> Result<ShmTransport> {
        let path = shm_path(name);
        let timeout = Duration::from_millis(self.config.bootstrap.connect_timeout_ms);
        let start = Instant::now();
        loop {
            match ShmTransport::open(&path, &self.config.ring) {
                Ok(t) => return Ok(t),
                Err(TransportError::Io(_)) | Err(TransportError::Codec { .. })
                    if start.elapsed() < timeout =>
                {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("opening {}", path.display()))
                }
            }
        }
    }
}

fn run_client(
    devices: &Devices,
    config: &TransportConfig,
    choice: TransportChoice,
    server: &str,
    messages: u64,
    size: usize,
) -> Result<Report> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let ctx = devices.open(&config.network)?;
    let boot = TcpBootstrap::new(config.bootstrap.clone());
    let mut stream = rt.block_on(boot.connect(server))?;
    let report = match choice {
        TransportChoice::Rdma => {
            let mut transport = rt.block_on(RdmaTransport::connect(&ctx, &mut stream, &config.ring))?;
            ping(&mut transport, messages, size)?
        }
        TransportChoice::Multiclient => {
            let mut client =
                rt.block_on(MulticlientClient::connect(&ctx, &mut stream, &config.multiclient))?;
            ping(&mut client, messages, size)?
        }
        TransportChoice::Shm => bail!("shared memory has no network client"),
    };
    debug!(metrics = %serde_json::to_string(&ctx.metrics().snapshot())?, "client metrics");
    Ok(report)
}

/// Sends `messages` payloads of `size` bytes and waits for each echo.
fn ping<T: Transport + ?Sized>(transport: &mut T, messages: u64, size: usize) -> Result<Report> {
    let payload = vec![0x5a; size];
    let start = Instant::now();
    for i in 0..messages {
        transport.send(&payload)?;
        let echo = transport.receive()?;
        if echo.len() != size {
            bail!("echo {} came back with {} bytes, sent {}", i, echo.len(), size);
        }
    }
    Ok(Report {
        role: "client",
        connections: 1,
        messages,
        bytes: messages * size as u64,
        elapsed: start.elapsed(),
    })
}

fn echo<T: Transport + ?Sized>(transport: &mut T, messages: u64) -> Result<Report> {
    let start = Instant::now();
    let mut bytes = 0;
    for _ in 0..messages {
        let message = transport.receive()?;
        bytes += message.len() as u64;
        transport.send(&message)?;
    }
    Ok(Report {
        role: "server",
        connections: 1,
        messages,
        bytes,
        elapsed: start.elapsed(),
    })
}
