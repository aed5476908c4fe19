// CLI entry point for poking at HighUDP endpoints by hand.
//
// Each subcommand runs one endpoint in a 60 Hz fixed-timestep loop:
//
//   highudp serve    [--bind ADDR] [--max-connections N] [--config PATH]
//       Echo server: every message received is sent back reliably.
//   highudp connect  ADDR [--bind ADDR] [--count N] [--message TEXT] [--config PATH]
//       Connect, send N reliable messages, print the echoes, disconnect.
//   highudp announce [--port PORT] [--message TEXT] [--interval SECS]
//       Broadcast a message on the local network periodically.
//   highudp listen   [--port PORT]
//       Print every Broadcast packet received on a port.
//
// Logging goes through `tracing`; set `RUST_LOG=highudp_transport=trace` to
// see per-packet detail.

use std::net::SocketAddr;
use std::time::Duration;

use highudp_protocol::MAX_PAYLOAD_SIZE;
use highudp_transport::{
    BroadcastListener, BroadcastSender, Client, ClientEvent, ConnectOptions, NetResult, Server,
    ServerEvent, TransportConfig, local_ip,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TICK_RATE: f64 = 60.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Serve,
    Connect,
    Announce,
    Listen,
}

struct Options {
    command: Command,
    target: Option<SocketAddr>,
    bind: Option<String>,
    max_connections: usize,
    count: u32,
    message: String,
    port: u16,
    interval: f64,
    config: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let options = parse_args();
    let result = match options.command {
        Command::Serve => run_serve(&options),
        Command::Connect => run_connect(&options),
        Command::Announce => run_announce(&options),
        Command::Listen => run_listen(&options),
    };
    if let Err(e) = result {
        eprintln!("highudp: {e}");
        std::process::exit(1);
    }
}

fn load_config(options: &Options) -> NetResult<TransportConfig> {
    match &options.config {
        Some(path) => TransportConfig::load(path),
        None => Ok(TransportConfig::default()),
    }
}

fn sleep_tick() {
    std::thread::sleep(Duration::from_secs_f64(1.0 / TICK_RATE));
}

fn run_serve(options: &Options) -> NetResult<()> {
    let bind = options.bind.as_deref().unwrap_or("0.0.0.0:7777");
    let mut server = Server::with_config(bind, options.max_connections, load_config(options)?)?;
    info!(addr = %server.local_addr(), host = %local_ip(), "echo server listening");

    loop {
        for event in server.tick(1.0 / TICK_RATE) {
            match event {
                ServerEvent::Connected(addr) => info!(peer = %addr, "peer connected"),
                ServerEvent::Disconnected(addr) => info!(peer = %addr, "peer disconnected"),
            }
        }
        while let Some((payload, from)) = server.recv() {
            println!("{from}: {}", String::from_utf8_lossy(&payload));
            server.send_to(from, &payload, true);
        }
        sleep_tick();
    }
}

fn run_connect(options: &Options) -> NetResult<()> {
    let Some(target) = options.target else {
        usage_error("connect requires a server address");
    };
    let bind = options.bind.as_deref().unwrap_or("0.0.0.0:0");
    let mut client = Client::with_config(bind, load_config(options)?)?;
    client.connect_with(target, &ConnectOptions::default());
    info!(addr = %client.local_addr(), server = %target, "connecting");

    let mut replies = 0;
    loop {
        for event in client.tick(1.0 / TICK_RATE) {
            match event {
                ClientEvent::Connected(addr) => {
                    info!(server = %addr, count = options.count, "connected, sending");
                    for i in 1..=options.count {
                        client.send(format!("{} #{i}", options.message).as_bytes(), true);
                    }
                }
                ClientEvent::ConnectionFailed(addr) => {
                    eprintln!("highudp: could not connect to {addr}");
                    std::process::exit(1);
                }
                ClientEvent::Disconnected(addr) => {
                    eprintln!("highudp: lost connection to {addr}");
                    std::process::exit(1);
                }
            }
        }
        while let Some(payload) = client.recv() {
            println!("{}", String::from_utf8_lossy(&payload));
            replies += 1;
        }
        if replies >= options.count {
            info!(replies, "all echoes received");
            client.close();
            return Ok(());
        }
        sleep_tick();
    }
}

fn run_announce(options: &Options) -> NetResult<()> {
    let sender = BroadcastSender::bind("0.0.0.0:0")?;
    info!(port = options.port, interval = options.interval, "announcing");
    loop {
        if let Err(e) = sender.broadcast(options.port, options.message.as_bytes()) {
            warn!(error = %e, "broadcast failed");
        }
        std::thread::sleep(Duration::from_secs_f64(options.interval));
    }
}

fn run_listen(options: &Options) -> NetResult<()> {
    let mut listener = BroadcastListener::bind(options.port)?;
    info!(addr = %listener.local_addr()?, "listening for broadcasts");
    loop {
        listener.fetch();
        while let Some((payload, from)) = listener.recv() {
            println!("{from}: {}", String::from_utf8_lossy(&payload));
        }
        sleep_tick();
    }
}

/// Parse command-line arguments. Uses simple `std::env::args()` matching,
/// no clap dependency.
fn parse_args() -> Options {
    let args: Vec<String> = std::env::args().collect();
    let command = match args.get(1).map(String::as_str) {
        Some("serve") => Command::Serve,
        Some("connect") => Command::Connect,
        Some("announce") => Command::Announce,
        Some("listen") => Command::Listen,
        Some("--help" | "-h") => {
            print_usage();
            std::process::exit(0);
        }
        Some(other) => usage_error(&format!("unknown command: {other}")),
        None => usage_error("missing command"),
    };

    let mut options = Options {
        command,
        target: None,
        bind: None,
        max_connections: 16,
        count: 5,
        message: "hello".into(),
        port: 7778,
        interval: 1.0,
        config: None,
    };

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                i += 1;
                options.bind = Some(value(&args, i, "--bind").to_owned());
            }
            "--max-connections" => {
                i += 1;
                options.max_connections = parsed(&args, i, "--max-connections");
            }
            "--count" => {
                i += 1;
                options.count = parsed(&args, i, "--count");
            }
            "--message" => {
                i += 1;
                options.message = value(&args, i, "--message").to_owned();
            }
            "--port" => {
                i += 1;
                options.port = parsed(&args, i, "--port");
            }
            "--interval" => {
                i += 1;
                options.interval = parsed(&args, i, "--interval");
            }
            "--config" => {
                i += 1;
                options.config = Some(value(&args, i, "--config").to_owned());
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other if command == Command::Connect && options.target.is_none() => {
                options.target = Some(
                    other
                        .parse()
                        .unwrap_or_else(|_| usage_error(&format!("invalid address: {other}"))),
                );
            }
            other => usage_error(&format!("unknown argument: {other}")),
        }
        i += 1;
    }

    // Leave room for the " #N" suffix `connect` appends.
    if options.message.len() + 12 > MAX_PAYLOAD_SIZE {
        usage_error("--message is too long");
    }
    if !(options.interval.is_finite() && options.interval > 0.0) {
        usage_error("--interval must be a positive number of seconds");
    }
    options
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    args.get(i)
        .map(String::as_str)
        .unwrap_or_else(|| usage_error(&format!("{flag} requires a value")))
}

fn parsed<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> T {
    value(args, i, flag)
        .parse()
        .unwrap_or_else(|_| usage_error(&format!("{flag} requires a valid number")))
}

fn usage_error(message: &str) -> ! {
    eprintln!("highudp: {message}");
    print_usage();
    std::process::exit(1);
}

fn print_usage() {
    println!("Usage: highudp <COMMAND> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  serve                    Echo every received message back to its sender");
    println!("  connect <ADDR>           Connect, send messages, print the echoes");
    println!("  announce                 Broadcast a message periodically");
    println!("  listen                   Print broadcasts received on a port");
    println!();
    println!("Options:");
    println!("  --bind <ADDR>            Local address (serve: 0.0.0.0:7777, connect: 0.0.0.0:0)");
    println!("  --max-connections <N>    serve: connection cap (default: 16)");
    println!("  --count <N>              connect: messages to send (default: 5)");
    println!("  --message <TEXT>         connect/announce payload (default: hello)");
    println!("  --port <PORT>            announce/listen port (default: 7778)");
    println!("  --interval <SECS>        announce: seconds between broadcasts (default: 1.0)");
    println!("  --config <PATH>          JSON file overriding TransportConfig fields");
    println!("  --help, -h               Show this help");
}
