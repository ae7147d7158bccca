use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "v6seek", version)]
#[command(about = "Model-guided IPv6 address discovery.")]
pub struct CommandLine {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,
    /// Stop after this many iterations, overriding the configuration
    #[arg(long)]
    pub max_iterations: Option<u64>,
    /// Skip the start-up banner
    #[arg(long)]
    pub no_banner: bool,
}

impl CommandLine {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
