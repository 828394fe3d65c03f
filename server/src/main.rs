//! The `pacs-server` binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use pacs_server::{PacsServer, ServerConfig};
use pacs_ul::pdu::DEFAULT_MAX_PDU;
use pacs_ul::FullAeAddr;

/// DICOM storage, query/retrieve, worklist and MPPS SCP
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// the application entity title of this node
    #[arg(long = "ae-title", default_value = "PACS-SCP")]
    ae_title: String,

    /// which address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// which port to listen on
    #[arg(short, long, default_value_t = 11112)]
    port: u16,

    /// path of the index database file
    #[arg(long = "db", default_value = "pacs-index.db")]
    db_path: String,

    /// root directory for stored instances
    #[arg(long = "storage", default_value = "pacs-storage")]
    storage_dir: PathBuf,

    /// maximum PDU length
    #[arg(short = 'm', long = "max-pdu-length", default_value_t = DEFAULT_MAX_PDU)]
    max_pdu_length: u32,

    /// enforce the maximum PDU length on received PDUs
    #[arg(short = 's', long = "strict")]
    strict: bool,

    /// accept unknown abstract syntaxes
    #[arg(long)]
    promiscuous: bool,

    /// accept any called AE title instead of requiring a match
    #[arg(long = "accept-any-aet")]
    accept_any_aet: bool,

    /// idle seconds after which an association is aborted
    #[arg(long = "idle-timeout", default_value_t = 60)]
    idle_timeout: u64,

    /// a known C-MOVE destination, as AET@host:port (repeatable)
    #[arg(long = "node", value_name = "AET@HOST:PORT")]
    nodes: Vec<String>,

    /// workers for the storage/query execution stage
    #[arg(long = "storage-workers")]
    storage_workers: Option<usize>,
}

fn main() {
    let app = match App::try_parse() {
        Ok(app) => app,
        Err(error) => {
            // clap renders --help and --version through this path too
            let _ = error.print();
            let code = if error.use_stderr() { 1 } else { 0 };
            std::process::exit(code);
        }
    };

    let filter = if app.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut remote_nodes = Vec::with_capacity(app.nodes.len());
    for node in &app.nodes {
        match node.parse::<FullAeAddr>() {
            Ok(addr) => remote_nodes.push(addr),
            Err(parse_error) => {
                eprintln!("invalid --node `{node}`: {parse_error}");
                std::process::exit(1);
            }
        }
    }

    let mut pipeline = pacs_pipeline::PipelineConfig::default();
    if let Some(workers) = app.storage_workers {
        pipeline.execution_workers = workers;
    }

    let config = ServerConfig {
        ae_title: app.ae_title,
        host: app.host,
        port: app.port,
        db_path: app.db_path,
        storage_dir: app.storage_dir,
        max_pdu_length: app.max_pdu_length,
        strict: app.strict,
        promiscuous: app.promiscuous,
        enforce_called_ae_title: !app.accept_any_aet,
        idle_timeout: (app.idle_timeout > 0).then(|| Duration::from_secs(app.idle_timeout)),
        remote_nodes,
        pipeline,
    };

    let server = match PacsServer::bind(config) {
        Ok(server) => server,
        Err(bind_error) => {
            error!("{}", snafu::Report::from_error(bind_error));
            std::process::exit(2);
        }
    };

    if let Err(run_error) = server.run() {
        error!("{}", snafu::Report::from_error(run_error));
        std::process::exit(2);
    }
}
