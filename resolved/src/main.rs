mod hints;
mod metrics;

use std::collections::HashSet;
use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

use dns_resolver::cache::{Cache, CachePaths, SharedCache};
use dns_resolver::context::Context;
use dns_resolver::resolve;
use dns_resolver::util::net::send_udp_bytes_to;
use dns_resolver::util::types::NoConnectivityPolicy;
use dns_types::protocol::types::{Message, Opcode, Rcode};

use metrics::serve_prometheus_endpoint_task;

const DNS_PORT: u16 = 53;

fn begin_logging() {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        let mut set = HashSet::new();
        for s in var.split(',') {
            set.insert(s.to_string());
        }
        set
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        logger.json().init();
    } else if log_format.contains("pretty") {
        logger.pretty().init();
    } else if log_format.contains("compact") {
        logger.compact().init();
    } else {
        logger.init();
    }
}

/// An iterative recursive DNS resolver with an on-disk cache.
///
/// Prometheus metrics are served at
/// "http://{metrics_interface}:{metrics_port}/metrics"
#[derive(Debug, Clone, Parser)]
struct Args {
    /// Interface to listen on
    #[clap(short, long, value_parser, default_value_t = Ipv4Addr::UNSPECIFIED)]
    interface: Ipv4Addr,

    /// Port to listen on
    #[clap(short, long, value_parser, default_value_t = DNS_PORT)]
    port: u16,

    /// Interface to serve Prometheus metrics on
    #[clap(long, value_parser, default_value_t = Ipv4Addr::LOCALHOST)]
    metrics_interface: Ipv4Addr,

    /// Port to serve Prometheus metrics on
    #[clap(long, value_parser, default_value_t = 9420)]
    metrics_port: u16,

    /// Path to the root hints file
    #[clap(long, value_parser, default_value = "root_servers.txt")]
    root_hints: PathBuf,

    /// Path to the on-disk A-record cache file
    #[clap(long, value_parser, default_value = "a_records_cache.txt")]
    a_cache_file: PathBuf,

    /// Path to the on-disk NS-record cache file
    #[clap(long, value_parser, default_value = "ns_records_cache.txt")]
    ns_cache_file: PathBuf,

    /// Path to the on-disk AAAA-record cache file. If omitted, AAAA
    /// records learned during resolution are cached in memory only.
    #[clap(long, value_parser)]
    aaaa_cache_file: Option<PathBuf>,

    /// What to do when every candidate nameserver for a resolution
    /// fails to respond: answer with SERVFAIL, or exit the process
    #[clap(long, value_parser, default_value = "server-failure")]
    on_no_connectivity: NoConnectivityPolicy,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    begin_logging();

    let paths = CachePaths {
        a: args.a_cache_file.clone(),
        ns: args.ns_cache_file.clone(),
        aaaa: args.aaaa_cache_file.clone(),
    };

    // Checked before `Cache::load`, which returns an empty default for
    // either file regardless of whether it was missing or just empty:
    // seeding must only happen for a file that didn't exist, or a
    // restart would reseed root hints over real, already-learned
    // delegations every time.
    let a_cache_existed = args.a_cache_file.exists();
    let ns_cache_existed = args.ns_cache_file.exists();

    let mut cache = match Cache::load(&paths) {
        Ok(c) => c,
        Err(error) => {
            tracing::error!(%error, "could not load cache files");
            process::exit(1);
        }
    };

    tracing::info!(path = %args.root_hints.display(), "loading root hints");
    match hints::load(&args.root_hints) {
        Ok(root_hints) => {
            if !a_cache_existed {
                cache.seed_a_from_hints(&root_hints);
            }
            if !ns_cache_existed {
                cache.seed_ns_from_hints(&root_hints);
            }
        }
        Err(error) => {
            tracing::error!(%error, "could not load root hints");
            process::exit(1);
        }
    }

    cache.sweep(dns_resolver::cache::now());
    let cache = SharedCache::new(cache);

    tracing::info!(interface = %args.interface, port = %args.port, "binding DNS UDP socket");
    let socket = match UdpSocket::bind((args.interface, args.port)).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(%error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(
        interface = %args.metrics_interface,
        port = %args.metrics_port,
        "binding HTTP TCP socket"
    );
    let metrics_interface = args.metrics_interface;
    let metrics_port = args.metrics_port;
    tokio::spawn(async move {
        if let Err(error) = serve_prometheus_endpoint_task(metrics_interface, metrics_port).await
        {
            tracing::error!(%error, "metrics server failed");
        }
    });

    serve(socket, cache, &paths, args.on_no_connectivity).await;
}

/// The single-threaded server loop: one request is read, resolved, and
/// answered at a time, on the same socket that also carries every
/// upstream query this process makes. See `dns_resolver::context::Context`
/// for why that sharing is deliberate rather than an oversight.
async fn serve(
    socket: UdpSocket,
    cache: SharedCache,
    paths: &CachePaths,
    on_no_connectivity: NoConnectivityPolicy,
) {
    let mut buf = [0u8; 512];

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                if let Err(error) = cache.persist(paths) {
                    tracing::error!(%error, "could not persist cache on shutdown");
                }
                process::exit(0);
            }

            result = socket.recv_from(&mut buf) => {
                let (n, peer) = match result {
                    Ok(ok) => ok,
                    Err(error) => {
                        tracing::warn!(%error, "error reading from socket");
                        continue;
                    }
                };

                let response = match handle_raw_message(&socket, &cache, paths, on_no_connectivity, &buf[..n]).await {
                    Some(response) => response,
                    None => continue,
                };

                match response.into_octets() {
                    Ok(mut bytes) => {
                        if let Err(error) = send_udp_bytes_to(&socket, peer, &mut bytes).await {
                            tracing::warn!(%error, %peer, "error replying to client");
                        }
                    }
                    Err(error) => tracing::warn!(%error, "could not serialise response"),
                }

                if let Err(error) = cache.persist(paths) {
                    tracing::warn!(%error, "could not persist cache");
                }
            }
        }
    }
}

async fn handle_raw_message(
    socket: &UdpSocket,
    cache: &SharedCache,
    paths: &CachePaths,
    on_no_connectivity: NoConnectivityPolicy,
    buf: &[u8],
) -> Option<Message> {
    let query = match Message::from_octets(buf) {
        Ok(query) => query,
        Err(error) => {
            tracing::debug!(%error, "could not parse query");
            return error.id().map(Message::make_format_error_response);
        }
    };

    if query.header.is_response {
        return Some(Message::make_format_error_response(query.header.id));
    }
    if query.header.opcode != Opcode::Standard {
        let mut response = query.make_response();
        response.header.rcode = Rcode::NotImplemented;
        return Some(response);
    }

    let mut response = query.make_response();
    response.header.recursion_available = true;

    // This server only ever answers the first question: a query with
    // more than one is not something a well-behaved client sends.
    let question = match query.questions.first() {
        Some(question) => question,
        None => return Some(response),
    };

    let started_at = Instant::now();
    let mut ctx = Context::new(cache, socket);
    match resolve(&mut ctx, question).await {
        Ok((rcode, answers)) => {
            response.header.rcode = rcode;
            response.answers = answers;
            tracing::info!(
                ?question,
                ?rcode,
                answers = response.answers.len(),
                duration_seconds = %started_at.elapsed().as_secs_f64(),
                "ok"
            );
        }
        Err(error) => {
            tracing::debug!(?question, %error, "resolution failed");
            use dns_resolver::util::types::ResolutionError;
            match error {
                ResolutionError::NoConnectivity => match on_no_connectivity {
                    NoConnectivityPolicy::ServerFailure => {
                        response.header.rcode = Rcode::ServerFailure;
                    }
                    NoConnectivityPolicy::Terminate => {
                        tracing::error!("no connectivity, terminating");
                        if let Err(persist_error) = cache.persist(paths) {
                            tracing::error!(%persist_error, "could not persist cache before exit");
                        }
                        process::exit(1);
                    }
                },
                _ => {
                    response.header.rcode = Rcode::ServerFailure;
                }
            }
        }
    }

    ctx.done().record_global();
    Some(response)
}
