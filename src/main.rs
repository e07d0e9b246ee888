//! CLI entry point.

use clap::Parser;
use netmeter::config::{Protocol, Role, TestConfig};
use netmeter::{client, units, Server};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage: netmeter [-s|-c host] [options]
       netmeter [-h|-v]

  -s            run in server mode
  -c HOST       run in client mode, connecting to HOST
  -p PORT       server port to listen on/connect to (default 5201)
  -f FORMAT     report format: k/K/m/M/g/G/a/A
  -i SECS       seconds between periodic bandwidth reports
  -T            collect per-interval TCP diagnostics
  -V            verbose output
  -d            emit debugging output
  -v            show version information and quit
  -h            show this message and quit

Client specific:
  -t SECS       time in seconds to transmit for (default 10)
  -n BYTES      number of bytes to transmit (instead of -t)
  -P N          number of parallel data streams
  -u            use UDP rather than TCP
  -b RATE       target bandwidth in bits/sec (UDP only, default 1 Mbit/sec)
  -l LEN        length of one read/write block
  -w BUF        socket buffer size
  -M MSS        set TCP maximum segment size
  -N            set TCP_NODELAY, disabling Nagle's algorithm
  -m            print the TCP maximum segment size
  -R            run in reverse mode (server sends)
";

#[derive(Parser, Debug)]
#[command(name = "netmeter", disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Run in server mode
    #[arg(short = 's', long = "server")]
    server: bool,

    /// Run in client mode, connecting to HOST
    #[arg(short = 'c', long = "client", value_name = "HOST")]
    client: Option<String>,

    #[arg(short = 'p', long = "port", value_name = "PORT")]
    port: Option<u16>,

    #[arg(short = 't', long = "time", value_name = "SECS")]
    time: Option<u64>,

    #[arg(short = 'n', long = "bytes", value_name = "BYTES")]
    bytes: Option<String>,

    #[arg(short = 'P', long = "parallel", value_name = "N")]
    parallel: Option<u32>,

    #[arg(short = 'u', long = "udp")]
    udp: bool,

    #[arg(short = 'b', long = "bandwidth", value_name = "RATE")]
    bandwidth: Option<String>,

    #[arg(short = 'l', long = "length", value_name = "LEN")]
    length: Option<String>,

    #[arg(short = 'w', long = "window", value_name = "BUF")]
    window: Option<String>,

    #[arg(short = 'i', long = "interval", value_name = "SECS")]
    interval: Option<u64>,

    #[arg(short = 'M', long = "set-mss", value_name = "MSS")]
    set_mss: Option<u32>,

    #[arg(short = 'N', long = "no-delay")]
    no_delay: bool,

    #[arg(short = 'm', long = "print-mss")]
    print_mss: bool,

    #[arg(short = 'T', long = "tcp-info")]
    tcp_info: bool,

    #[arg(short = 'R', long = "reverse")]
    reverse: bool,

    #[arg(short = 'f', long = "format", value_name = "FORMAT")]
    format: Option<char>,

    #[arg(short = 'V', long = "verbose")]
    verbose: bool,

    #[arg(short = 'd', long = "debug")]
    debug: bool,

    #[arg(short = 'v', long = "version")]
    version: bool,

    #[arg(short = 'h', long = "help")]
    help: bool,
}

fn usage_error(message: &str) -> ! {
    eprintln!("netmeter: {}", message);
    eprint!("{}", USAGE);
    std::process::exit(2);
}

fn parse_with(value: Option<&str>, what: &str, parse: impl Fn(&str) -> Option<u64>) -> Option<u64> {
    value.map(|v| match parse(v) {
        Some(n) => n,
        None => usage_error(&format!("cannot parse {} value '{}'", what, v)),
    })
}

fn build_config(cli: &Cli) -> TestConfig {
    let mut cfg = match (&cli.client, cli.server) {
        (Some(host), false) => TestConfig::client(host.clone()),
        (None, true) => TestConfig::server(),
        (Some(_), true) => usage_error("cannot be both server (-s) and client (-c)"),
        (None, false) => usage_error("one of -s or -c must be given"),
    };

    if cfg.role == Role::Server {
        let client_only = cli.time.is_some()
            || cli.bytes.is_some()
            || cli.parallel.is_some()
            || cli.udp
            || cli.bandwidth.is_some()
            || cli.length.is_some()
            || cli.window.is_some()
            || cli.set_mss.is_some()
            || cli.no_delay
            || cli.print_mss
            || cli.reverse;
        if client_only {
            usage_error("this option is client only");
        }
    }

    cfg.protocol = if cli.udp { Protocol::Udp } else { Protocol::Tcp };
    cfg.blksize = cfg.protocol.default_blksize();

    if let Some(port) = cli.port {
        cfg.port = port;
    }
    cfg.bytes = parse_with(cli.bytes.as_deref(), "byte count", units::parse_size).unwrap_or(0);
    cfg.duration_secs = match cli.time {
        Some(t) => t,
        // -n alone makes the test byte-bounded
        None if cfg.bytes > 0 => 0,
        None => cfg.duration_secs,
    };
    if let Some(parallel) = cli.parallel {
        cfg.parallel = parallel;
    }
    cfg.reverse = cli.reverse;
    if let Some(rate) = parse_with(cli.bandwidth.as_deref(), "bandwidth", units::parse_rate) {
        cfg.rate = rate;
    }
    if let Some(blksize) = parse_with(cli.length.as_deref(), "block length", units::parse_size) {
        cfg.blksize = blksize as usize;
    }
    if let Some(window) = parse_with(cli.window.as_deref(), "socket buffer size", units::parse_size)
    {
        cfg.window = window as usize;
    }
    if let Some(interval) = cli.interval {
        cfg.interval_secs = interval;
    }
    if let Some(mss) = cli.set_mss {
        cfg.mss = mss;
    }
    cfg.no_delay = cli.no_delay;
    cfg.print_mss = cli.print_mss;
    cfg.tcp_info = cli.tcp_info;
    if let Some(format) = cli.format {
        cfg.format = format;
    }
    cfg.verbose = cli.verbose;
    cfg.debug = cli.debug;

    if let Err(e) = cfg.validate() {
        usage_error(&e.to_string());
    }
    cfg
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };
    if cli.version {
        println!("netmeter {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }
    if cli.help {
        eprint!("{}", USAGE);
        std::process::exit(1);
    }

    let cfg = build_config(&cli);

    let default_level = if cfg.debug {
        "debug"
    } else if cfg.verbose {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let code = match cfg.role {
        Role::Server => run_server(cfg).await,
        Role::Client => run_client(cfg).await,
    };
    std::process::exit(code);
}

async fn run_server(cfg: TestConfig) -> i32 {
    let server = match Server::bind(cfg) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("netmeter: {}", e);
            return 1;
        }
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown.send(());
        }
    });

    match server.run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("netmeter: {}", e);
            1
        }
    }
}

async fn run_client(cfg: TestConfig) -> i32 {
    match client::run(cfg).await {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("netmeter: {}", e);
            1
        }
    }
}
