use clap::{Parser, ValueEnum};

#[derive(Parser, Debug, Clone)]
#[command(name = "qakka", about)]
pub struct Cli {
    /// Where to load config from
    #[arg(long, value_enum, default_value_t = ConfigSource::File)]
    pub config: ConfigSource,

    /// Config file path (File source only; QAKKA_CONFIG wins when set)
    #[arg(long)]
    pub config_path: Option<String>,

    /// Tokio worker threads
    #[arg(long, default_value_t = default_workers())]
    pub workers: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum ConfigSource {
    /// Read config/qakka.toml (or QAKKA_CONFIG / --config-path)
    File,
    /// Read the whole TOML document from QAKKA_CONFIG_TOML
    Env,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}
