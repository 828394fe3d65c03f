//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use pacs_pipeline::PipelineConfig;
use pacs_services::{uids, ServiceRegistry};
use pacs_ul::association::machine::ScpMachineOptions;
use pacs_ul::pdu::DEFAULT_MAX_PDU;
use pacs_ul::FullAeAddr;

/// Everything the server needs to come up.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This node's AE title
    pub ae_title: String,
    /// Address to listen on
    pub host: String,
    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,
    /// Path of the index database file
    pub db_path: String,
    /// Root directory of the blob store
    pub storage_dir: PathBuf,
    /// Maximum PDU length this node is willing to receive
    pub max_pdu_length: u32,
    /// Whether incoming PDUs over the negotiated maximum are refused
    pub strict: bool,
    /// Whether to accept unknown abstract syntaxes
    pub promiscuous: bool,
    /// Whether to require the called AE title to match `ae_title`
    pub enforce_called_ae_title: bool,
    /// Idle timeout after which an association is aborted
    pub idle_timeout: Option<Duration>,
    /// Known C-MOVE destinations
    pub remote_nodes: Vec<FullAeAddr>,
    /// Pipeline tuning
    pub pipeline: PipelineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ae_title: "PACS-SCP".to_string(),
            host: "0.0.0.0".to_string(),
            port: 11112,
            db_path: "pacs-index.db".to_string(),
            storage_dir: PathBuf::from("pacs-storage"),
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            enforce_called_ae_title: true,
            idle_timeout: Some(Duration::from_secs(60)),
            remote_nodes: Vec::new(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build the state machine options for one incoming connection,
    /// advertising every SOP class the registry serves
    /// and the uncompressed little-endian transfer syntaxes.
    pub fn scp_options(&self, registry: &ServiceRegistry) -> ScpMachineOptions {
        let mut options = ScpMachineOptions::new()
            .ae_title(self.ae_title.clone())
            .max_pdu_length(self.max_pdu_length)
            .promiscuous(self.promiscuous)
            .with_transfer_syntax(uids::EXPLICIT_VR_LE)
            .with_transfer_syntax(uids::IMPLICIT_VR_LE);
        for abstract_syntax in registry.abstract_syntaxes() {
            options = options.with_abstract_syntax(abstract_syntax.to_string());
        }
        if self.enforce_called_ae_title {
            options = options.ae_access_control(pacs_ul::association::AcceptCalledAeTitle);
        }
        options
    }
}
