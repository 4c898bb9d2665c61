use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use flexi_logger::{Duplicate, FileSpec, Logger};
use structopt::StructOpt;
use svn_bridge_cache::MetadataCache;
use svn_bridge_source::{memory::InMemorySource, Credentials, SourceControl};
use svn_path::CasePolicy;

mod error;
mod report;
mod server;

#[derive(Debug, StructOpt)]
struct Opt {
    #[structopt(
        short,
        long,
        default_value = "127.0.0.1:8081",
        help = "address to accept DAV client connections on"
    )]
    listen: SocketAddr,

    #[structopt(long, help = "upstream CVCS server URL")]
    upstream: String,

    #[structopt(long, help = "log file path; log to stderr only when omitted")]
    log_file: Option<PathBuf>,

    #[structopt(long, help = "compare server paths case-insensitively")]
    case_insensitive: bool,

    #[structopt(
        long,
        default_value = "3",
        help = "maximum concurrent upstream content fetches per request"
    )]
    max_in_flight: usize,

    #[structopt(
        long,
        parse(try_from_str = parse_duration::parse::parse),
        default_value = "4h",
        help = "maximum wall time for one content prefetch run"
    )]
    production_deadline: Duration,

    #[structopt(
        long,
        parse(try_from_str = parse_duration::parse::parse),
        default_value = "4h",
        help = "how long the prefetcher waits on a stuck consumer before failing the request"
    )]
    consumption_deadline: Duration,

    #[structopt(long, default_value = "", help = "username for anonymous upstream reads")]
    username: String,

    #[structopt(long, default_value = "", help = "password for anonymous upstream reads")]
    password: String,

    #[structopt(long, default_value = "", help = "domain for anonymous upstream reads")]
    domain: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let logger = Logger::try_with_env_or_str("info")?;
    match &opt.log_file {
        Some(path) => {
            logger
                .log_to_file(FileSpec::try_from(path.clone())?)
                .duplicate_to_stderr(Duplicate::Warn)
                .start()?;
        }
        None => {
            logger.start()?;
        }
    }

    let creds = Credentials {
        username: opt.username.clone(),
        password: opt.password.clone(),
        domain: opt.domain.clone(),
    };
    let policy = if opt.case_insensitive {
        CasePolicy::Insensitive
    } else {
        CasePolicy::Sensitive
    };

    let source = connect_upstream(&opt.upstream)?;

    // The metadata cache lives for the whole process; request handlers
    // share it by reference rather than through a hidden singleton.
    let cache = Arc::new(MetadataCache::new(
        opt.upstream.clone(),
        creds.clone(),
        policy,
        source.clone(),
    ));

    let loader_config = svn_bridge_loader::Config {
        max_in_flight: opt.max_in_flight,
        production_deadline: opt.production_deadline,
        consumption_deadline: opt.consumption_deadline,
        ..svn_bridge_loader::Config::default()
    };

    let bridge = Arc::new(server::Bridge::new(
        source,
        cache,
        creds,
        policy,
        loader_config,
    ));

    server::serve(opt.listen, bridge).await
}

/// Builds the upstream collaborator for the configured URL.
///
/// The RPC client proper plugs in behind [`SourceControl`]; this build
/// wires the in-memory backend for `memory:` URLs, which is what local
/// development and the test-suites run against.
fn connect_upstream(url: &str) -> anyhow::Result<Arc<dyn SourceControl>> {
    if url.starts_with("memory:") {
        log::warn!("serving the in-memory backend for {}", url);
        return Ok(Arc::new(InMemorySource::new()));
    }

    anyhow::bail!(
        "no upstream client is wired for {}; only memory: URLs are supported by this build",
        url
    )
}
