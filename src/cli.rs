//! CLI & Process Wiring — process argument parsing. This is ambient
//! plumbing around the core: it builds a `Config` and is never reached
//! for by the core components themselves.

use crate::config::{CaConfig, Config, Mode, StoreConfig};
use clap::Parser;
use std::path::PathBuf;

/// Local, interactive MITM proxy for inspecting HTTP/1.1, HTTP/2, HTTPS
/// and SSE traffic.
#[derive(Parser, Debug)]
#[command(name = "proxycraft", version, about)]
pub struct Cli {
    /// Address the proxy listens on.
    #[arg(long = "listen-host", default_value = "127.0.0.1")]
    pub listen_host: String,

    /// Port the proxy listens on.
    #[arg(long = "listen-port", default_value_t = 8080)]
    pub listen_port: u16,

    /// Enable verbose (debug-level) logging.
    #[arg(long = "verbose", short = 'v')]
    pub verbose: bool,

    /// Write completed entries to this file via the archival sink.
    #[arg(long = "output-file")]
    pub output_file: Option<PathBuf>,

    /// Tee captured exchanges to stdout as they complete.
    #[arg(long = "dump")]
    pub dump: bool,

    /// Write the root CA certificate (PEM) to this path and exit.
    #[arg(long = "export-ca")]
    pub export_ca: Option<PathBuf>,

    /// Use a custom root CA certificate (requires `-use-key`).
    #[arg(long = "use-ca", requires = "use_key")]
    pub use_ca: Option<PathBuf>,

    /// Use a custom root CA private key (requires `-use-ca`).
    #[arg(long = "use-key", requires = "use_ca")]
    pub use_key: Option<PathBuf>,

    /// Forward upstream traffic through this proxy (http://, https://, or
    /// socks5:// scheme).
    #[arg(long = "upstream-proxy")]
    pub upstream_proxy: Option<String>,

    /// Enable HTTPS interception (MITM). Without this flag, CONNECT
    /// tunnels are spliced opaquely.
    #[arg(long = "mitm")]
    pub mitm: bool,

    /// Inspection surface mode.
    #[arg(long = "mode", value_enum, default_value = "cli")]
    pub mode: CliMode,

    /// Periodically flush the archival sink every N seconds.
    #[arg(long = "auto-save")]
    pub auto_save: Option<u64>,

    /// In-memory traffic store capacity.
    #[arg(long = "store-capacity")]
    pub store_capacity: Option<usize>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliMode {
    Cli,
    Web,
}

impl From<CliMode> for Mode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Cli => Mode::Cli,
            CliMode::Web => Mode::Web,
        }
    }
}

impl Cli {
    /// Build a `Config` from parsed arguments, layered over defaults.
    pub fn into_config(self) -> Config {
        let mut config = Config {
            listen_host: self.listen_host,
            listen_port: self.listen_port,
            verbose: self.verbose,
            mitm: self.mitm,
            mode: self.mode.into(),
            output_file: self.output_file,
            dump: self.dump,
            auto_save_secs: self.auto_save,
            ca: CaConfig {
                custom_cert_path: self.use_ca,
                custom_key_path: self.use_key,
                ..CaConfig::default()
            },
            store: StoreConfig {
                capacity: self
                    .store_capacity
                    .unwrap_or(crate::config::DEFAULT_STORE_CAPACITY),
            },
            upstream_proxy: self.upstream_proxy,
        };
        config.expand_paths();
        config
    }
}
