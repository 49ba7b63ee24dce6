use std::path::PathBuf;

use anyhow::Result;
use clap::builder::BoolishValueParser;
use clap_serde_derive::ClapSerde;

#[derive(ClapSerde, Debug, Clone)]
pub struct Config {
    /// The address the listener binds to
    #[default("0.0.0.0".to_string())]
    #[arg(short, long, env)]
    pub(crate) address: String,

    /// The port the listener binds to
    #[default(5000)]
    #[arg(short, long, env)]
    pub(crate) port: u16,

    /// Enable debug level logging. Accepts true/false, 1/0, yes/no, on/off
    #[default(false)]
    #[arg(long, env = "FLASK_DEBUG", value_parser = BoolishValueParser::new())]
    pub(crate) debug: bool,

    /// Directory holding config.json, tokenizer.json and the safetensors weights
    #[default(PathBuf::from("./models/deepseek-coder-1.3b-instruct"))]
    #[arg(short, long, env)]
    pub(crate) model_path: PathBuf,

    /// Run on the CPU even when an accelerator is available
    #[default(false)]
    #[arg(long, env)]
    pub(crate) cpu: bool,

    /// Prompts are truncated to this many tokens before generation
    #[default(1024)]
    #[arg(long, env)]
    pub(crate) max_input_tokens: usize,

    /// Upper bound accepted for the max_length request parameter
    #[default(2048)]
    #[arg(long, env)]
    pub(crate) max_length_ceiling: usize,

    /// Number of generations allowed to run at the same time
    #[default(1)]
    #[arg(long, env)]
    pub(crate) max_concurrent_generations: usize,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let opt: <Config as ClapSerde>::Opt = toml::from_str(&str)?;
        Ok(Config::from(opt))
    }
}
