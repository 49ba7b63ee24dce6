use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use tracing::{info, warn};

const REQUIRED_FILES: [&str; 2] = ["config.json", "tokenizer.json"];
const OPTIONAL_FILES: [&str; 2] = ["tokenizer_config.json", "generation_config.json"];
const SINGLE_WEIGHTS: &str = "model.safetensors";
const SHARDED_WEIGHTS_INDEX: &str = "model.safetensors.index.json";

/// Downloads a checkpoint from the Hugging Face hub into the directory the server loads from
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Repository to download from
    #[arg(short, long, env, default_value = "deepseek-ai/deepseek-coder-1.3b-instruct")]
    repo_id: String,

    /// Revision of the repository
    #[arg(long, env, default_value = "main")]
    revision: String,

    /// Directory the files are copied into
    #[arg(short, long, env, default_value = "./models/deepseek-coder-1.3b-instruct")]
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let api = ApiBuilder::new().with_progress(true).build()?;
    let repo = api.repo(Repo::with_revision(
        args.repo_id.clone(),
        RepoType::Model,
        args.revision,
    ));
    std::fs::create_dir_all(&args.output)?;
    info!("Downloading {} to {}", args.repo_id, args.output.display());

    for filename in REQUIRED_FILES {
        fetch(&repo, filename, &args.output)?;
    }
    for filename in OPTIONAL_FILES {
        if let Err(err) = fetch(&repo, filename, &args.output) {
            warn!("Skipping {filename}: {err:#}");
        }
    }
    for filename in weight_files(&repo)? {
        fetch(&repo, &filename, &args.output)?;
    }

    for entry in std::fs::read_dir(&args.output)? {
        let entry = entry?;
        println!(
            "  - {} ({} bytes)",
            entry.file_name().to_string_lossy(),
            entry.metadata()?.len()
        );
    }
    println!("Model downloaded to {}", args.output.display());
    Ok(())
}

fn fetch(repo: &ApiRepo, filename: &str, output: &Path) -> Result<()> {
    let cached = repo
        .get(filename)
        .with_context(|| format!("Failed to download {filename}"))?;
    std::fs::copy(&cached, output.join(filename))
        .with_context(|| format!("Failed to copy {filename}"))?;
    info!("Fetched {filename}");
    Ok(())
}

#[derive(Debug, PartialEq)]
enum WeightSource {
    Single,
    Sharded,
}

/// Single-file checkpoints ship `model.safetensors`, larger ones an index naming their shards.
fn weight_source(siblings: &[String]) -> Result<WeightSource> {
    let has = |name: &str| siblings.iter().any(|file| file == name);
    if has(SINGLE_WEIGHTS) {
        Ok(WeightSource::Single)
    } else if has(SHARDED_WEIGHTS_INDEX) {
        Ok(WeightSource::Sharded)
    } else {
        bail!("Repository has neither {SINGLE_WEIGHTS} nor {SHARDED_WEIGHTS_INDEX}")
    }
}

fn shard_files(index: &serde_json::Value) -> Result<Vec<String>> {
    let shards = index["weight_map"]
        .as_object()
        .context("Shard index has no weight_map")?
        .values()
        .filter_map(|file| file.as_str().map(str::to_string))
        .collect::<BTreeSet<_>>();
    Ok(shards.into_iter().collect())
}

fn weight_files(repo: &ApiRepo) -> Result<Vec<String>> {
    let siblings = repo
        .info()
        .context("Failed to list repository files")?
        .siblings
        .into_iter()
        .map(|sibling| sibling.rfilename)
        .collect::<Vec<_>>();
    match weight_source(&siblings)? {
        WeightSource::Single => Ok(vec![SINGLE_WEIGHTS.to_string()]),
        WeightSource::Sharded => {
            let index = repo
                .get(SHARDED_WEIGHTS_INDEX)
                .with_context(|| format!("Failed to download {SHARDED_WEIGHTS_INDEX}"))?;
            shard_files(&serde_json::from_str(&std::fs::read_to_string(index)?)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn names(files: &[&str]) -> Vec<String> {
        files.iter().map(|file| file.to_string()).collect()
    }

    #[test]
    fn single_file_checkpoint() {
        let siblings = names(&["config.json", "model.safetensors", "tokenizer.json"]);
        assert_eq!(weight_source(&siblings).unwrap(), WeightSource::Single);
    }

    #[test]
    fn sharded_checkpoint() {
        let siblings = names(&[
            "config.json",
            "model-00001-of-00002.safetensors",
            "model-00002-of-00002.safetensors",
            "model.safetensors.index.json",
        ]);
        assert_eq!(weight_source(&siblings).unwrap(), WeightSource::Sharded);
    }

    #[test]
    fn checkpoint_without_safetensors_is_an_error() {
        let siblings = names(&["config.json", "pytorch_model.bin"]);
        assert!(weight_source(&siblings).is_err());
    }

    #[test]
    fn shard_names_are_deduplicated_and_sorted() {
        let index = json!({
            "weight_map": {
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors"
            }
        });
        assert_eq!(
            shard_files(&index).unwrap(),
            [
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors"
            ]
        );
        assert!(shard_files(&json!({})).is_err());
    }
}
