//! spanroute command line.

use clap::{Args, Parser, Subcommand};
use spanroute_core::{
    LogTracer, Protocol, ResultTable, TraceContext, Tracer, TracerouteConfig, TracerouteResult,
};
use spanroute_engine::{TcpTraceroute, UdpTraceroute};
use spanroute_service::{resolve_destination, Service, TraceConfig};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Traceroute with distributed-tracing spans.
#[derive(Parser, Debug)]
#[command(name = "spanroute")]
#[command(version)]
#[command(about = "Traceroute that emits one tracing span per probe")]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long = "log-level", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// TCP traceroute.
    Tcp(TraceArgs),
    /// UDP traceroute.
    Udp(TraceArgs),
    /// Run the scheduled trace service.
    Service {
        /// Path to the YAML configuration file.
        #[arg(long)]
        config: PathBuf,
    },
    /// Print a sample configuration.
    Config,
}

#[derive(Args, Debug)]
struct TraceArgs {
    /// IP or hostname to traceroute to.
    #[arg(long)]
    destination: String,

    /// Maximum hops for the traceroute.
    #[arg(short = 'm', long = "max-hops", default_value_t = 30)]
    max_hops: u8,

    /// Number of probes per hop.
    #[arg(short = 'q', long = "nqueries", default_value_t = 3)]
    nqueries: u16,

    /// Maximum number of parallel requests in flight.
    #[arg(short = 'N', long = "parallel-requests", default_value_t = 16)]
    parallel_requests: u16,

    /// Per-probe timeout in seconds.
    #[arg(short = 'w', long, default_value_t = 2)]
    timeout: u64,

    /// Destination port to probe.
    #[arg(short = 'p', long, default_value_t = 33434)]
    port: u16,

    /// Print the trace to stdout.
    #[arg(long = "print-results")]
    print_results: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.clone())
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> TracerouteResult<()> {
    match cli.command {
        Command::Tcp(args) => run_trace(Protocol::Tcp, args).await,
        Command::Udp(args) => run_trace(Protocol::Udp, args).await,
        Command::Service { config } => run_service(config).await,
        Command::Config => {
            println!("---\n{}", TraceConfig::sample().to_yaml()?);
            Ok(())
        }
    }
}

async fn run_trace(protocol: Protocol, args: TraceArgs) -> TracerouteResult<()> {
    let hostname = local_hostname();
    let tracer: Arc<dyn Tracer> = Arc::new(LogTracer);
    let addrs = resolve_destination(&args.destination).await?;

    for addr in addrs {
        let config = trace_config(&args, &hostname, tracer.clone());
        let table = match protocol {
            Protocol::Tcp => TcpTraceroute::new(addr, config)?.start().await?,
            Protocol::Udp => UdpTraceroute::new(addr, config)?.start().await?,
        };
        if args.print_results {
            print_results(addr, &table);
        }
    }
    Ok(())
}

async fn run_service(config: PathBuf) -> TracerouteResult<()> {
    let config = TraceConfig::load_from_file(config)?;
    let service = Service::new(config, local_hostname(), Arc::new(LogTracer));

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    service.run(cancel).await
}

/// Engine configuration with a fresh xid and baggage per destination address.
fn trace_config(args: &TraceArgs, hostname: &str, tracer: Arc<dyn Tracer>) -> TracerouteConfig {
    let xid = Uuid::new_v4();
    let trace_ctx = TraceContext::new()
        .with_baggage("destination_hostname", args.destination.clone())
        .with_baggage("source", hostname)
        .with_baggage("max_hops", args.max_hops.to_string())
        .with_baggage("xid", xid.to_string());

    TracerouteConfig {
        destination_hostname: args.destination.clone(),
        local_hostname: hostname.to_string(),
        max_hops: args.max_hops,
        num_measurements: args.nqueries,
        parallel_requests: args.parallel_requests,
        port: args.port,
        timeout: Duration::from_secs(args.timeout),
        tracer,
        xid,
        trace_ctx,
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn print_results(addr: Ipv4Addr, table: &ResultTable) {
    println!("traceroute to {}", addr);
    for (ttl, hops) in table {
        let rendered: Vec<String> = hops.iter().map(ToString::to_string).collect();
        println!("{:>3}  {}", ttl, rendered.join("  "));
    }
}
