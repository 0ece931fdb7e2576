use clap::Parser;

/// Command-line surface (spec §6). Every flag has an `env` fallback so the
/// same binary runs unmodified under a process supervisor that only sets
/// environment variables.
#[derive(Debug, Clone, Parser)]
#[command(name = "axon-gateway", version, about = "Request engine fronting multiple AI model providers.")]
pub struct CliArgs {
    /// Path to the JSON configuration document. Takes precedence over
    /// `AXON_CONFIG` when both are set.
    #[arg(long = "config", env = "AXON_CONFIG")]
    pub config: Option<String>,

    /// Bind port for the HTTP surface. Falls back to the config document's
    /// `port` field, then 8080.
    #[arg(long = "port", env = "AXON_PORT")]
    pub port: Option<u16>,

    /// Bind host for the HTTP surface.
    #[arg(long = "host", env = "AXON_HOST")]
    pub host: Option<String>,

    /// `debug|info|warn|error`. Falls back to `info` when unset.
    #[arg(long = "log-level", env = "AXON_LOG_LEVEL")]
    pub log_level: Option<String>,
}
