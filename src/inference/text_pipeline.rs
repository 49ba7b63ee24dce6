use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use rand::random;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::inference::model_config::SamplingParams;
use crate::inference::models::llama::{Llama, LlamaConfig};

const CONFIG_FILENAME: &str = "config.json";
const TOKENIZER_FILENAME: &str = "tokenizer.json";

/// Decoded output of one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Prompt and completion decoded together
    pub text: String,
    /// Only the newly generated tokens
    pub completion: String,
}

/// The inference capability the model host delegates to.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<Generation>;
}

// Taken from
// https://github.com/huggingface/candle/blob/main/candle-examples/examples/llama/main.rs
pub struct TextGeneratorPipeline {
    model: Llama,
    device: Device,
    tokenizer: Tokenizer,
    eos_token: u32,
    max_input_tokens: usize,
}

impl TextGeneratorPipeline {
    /// Loads a Llama-architecture checkpoint stored as `config.json`, `tokenizer.json` and one or more safetensors files.
    #[tracing::instrument(level = "info", skip(device))]
    pub fn from_local_dir(
        model_dir: &Path,
        device: &Device,
        max_input_tokens: usize,
        max_length_ceiling: usize,
    ) -> Result<TextGeneratorPipeline> {
        let config_file = model_dir.join(CONFIG_FILENAME);
        let raw_config = std::fs::read(&config_file)
            .with_context(|| format!("Cannot read {}", config_file.display()))?;
        let config: LlamaConfig = serde_json::from_slice(&raw_config)?;
        check_context_window(
            max_input_tokens,
            max_length_ceiling,
            config.max_position_embeddings,
        )?;
        config.position_scale()?;
        let eos_token = eos_token_id(&serde_json::from_slice(&raw_config)?)?;

        let tokenizer = Tokenizer::from_file(model_dir.join(TOKENIZER_FILENAME))
            .map_err(|e| anyhow!("Cannot load tokenizer: {e}"))?;

        let dtype = if device.is_cpu() {
            DType::F32
        } else {
            DType::F16
        };
        let weight_files = safetensors_files(model_dir)?;
        debug!("Loading {} weight file(s) as {:?}", weight_files.len(), dtype);
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weight_files, dtype, device)? };
        let model = Llama::load(vb, &config)?;

        Ok(TextGeneratorPipeline {
            model,
            device: device.clone(),
            tokenizer,
            eos_token,
            max_input_tokens,
        })
    }
}

impl TextGenerator for TextGeneratorPipeline {
    #[tracing::instrument(level = "info", skip(self, prompt))]
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<Generation> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("Cannot encode prompt: {e}"))?
            .get_ids()
            .to_vec();
        truncate_prompt(&mut tokens, self.max_input_tokens);
        if tokens.is_empty() {
            bail!("Prompt is empty");
        }
        let prompt_len = tokens.len();

        // Each generation owns its KV cache, the weights are only read
        let mut cache = self.model.new_cache();
        let mut logits_processor =
            LogitsProcessor::new(random(), Some(params.temperature), Some(params.top_p));

        let generated = sample_until_eos(
            &mut tokens,
            params.max_length,
            self.eos_token,
            |context, start_pos| {
                let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
                let logits = self.model.forward(&input, start_pos, &mut cache)?;
                Ok(logits_processor.sample(&logits.squeeze(0)?)?)
            },
        )?;
        debug!("Generated {generated} tokens");

        let text = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!("Cannot decode tokens: {e}"))?;
        let completion = self
            .tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| anyhow!("Cannot decode tokens: {e}"))?;

        Ok(Generation { text, completion })
    }
}

/// Keeps the first `max_tokens` ids of an over-long prompt.
fn truncate_prompt(tokens: &mut Vec<u32>, max_tokens: usize) {
    if tokens.len() > max_tokens {
        debug!("Truncating prompt from {} to {} tokens", tokens.len(), max_tokens);
        tokens.truncate(max_tokens);
    }
}

/// Appends up to `max_new` sampled tokens, stopping after `eos_token`.
/// `step` receives the ids the model has not seen yet and the position of the first one.
fn sample_until_eos<F>(
    tokens: &mut Vec<u32>,
    max_new: usize,
    eos_token: u32,
    mut step: F,
) -> Result<usize>
where
    F: FnMut(&[u32], usize) -> Result<u32>,
{
    for generated in 0..max_new {
        let context_size = if generated > 0 { 1 } else { tokens.len() };
        let start_pos = tokens.len().saturating_sub(context_size);
        let next_token = step(&tokens[start_pos..], start_pos)?;
        tokens.push(next_token);
        if next_token == eos_token {
            return Ok(generated + 1);
        }
    }
    Ok(max_new)
}

/// The longest prompt plus the longest reply has to fit in the rotary position table.
fn check_context_window(
    max_input_tokens: usize,
    max_length_ceiling: usize,
    max_position_embeddings: usize,
) -> Result<()> {
    if max_input_tokens + max_length_ceiling > max_position_embeddings {
        bail!(
            "max_input_tokens ({max_input_tokens}) + max_length_ceiling ({max_length_ceiling}) \
             exceeds the model context of {max_position_embeddings} tokens"
        );
    }
    Ok(())
}

/// `eos_token_id` is either a single id or a list of ids; the first one doubles as padding.
fn eos_token_id(config: &serde_json::Value) -> Result<u32> {
    let value = match config.get("eos_token_id") {
        Some(serde_json::Value::Array(ids)) => ids.first(),
        other => other,
    };
    match value.and_then(|id| id.as_u64()) {
        Some(id) => Ok(u32::try_from(id)?),
        None => bail!("{CONFIG_FILENAME} does not declare an eos_token_id"),
    }
}

fn safetensors_files(model_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = std::fs::read_dir(model_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
        .collect::<Vec<_>>();
    if files.is_empty() {
        bail!("No safetensors weights found in {}", model_dir.display());
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn eos_token_from_single_id() {
        assert_eq!(eos_token_id(&json!({"eos_token_id": 32021})).unwrap(), 32021);
    }

    #[test]
    fn eos_token_from_id_list() {
        assert_eq!(eos_token_id(&json!({"eos_token_id": [2, 7]})).unwrap(), 2);
    }

    #[test]
    fn eos_token_missing_is_an_error() {
        assert!(eos_token_id(&json!({"bos_token_id": 1})).is_err());
    }

    #[test]
    fn weight_files_are_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "model-00002-of-00002.safetensors",
            "model-00001-of-00002.safetensors",
            "tokenizer.json",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let files = safetensors_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            [
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors"
            ]
        );
    }

    #[test]
    fn no_weight_files_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(safetensors_files(dir.path()).is_err());
    }

    #[test]
    fn missing_config_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let err = TextGeneratorPipeline::from_local_dir(dir.path(), &Device::Cpu, 1024, 2048)
            .err()
            .unwrap();
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn long_prompt_keeps_its_first_tokens() {
        let mut tokens: Vec<u32> = (0..1500).collect();
        truncate_prompt(&mut tokens, 1024);
        assert_eq!(tokens.len(), 1024);
        assert_eq!(tokens.first(), Some(&0));
        assert_eq!(tokens.last(), Some(&1023));

        let mut exact: Vec<u32> = (0..1024).collect();
        truncate_prompt(&mut exact, 1024);
        assert_eq!(exact, (0..1024).collect::<Vec<u32>>());
    }

    #[test]
    fn sampling_stops_after_eos() {
        let mut tokens = vec![10, 11, 12];
        let mut replies = [5, 6, 2, 7].into_iter();
        let mut seen = Vec::new();

        let generated = sample_until_eos(&mut tokens, 10, 2, |context, start_pos| {
            seen.push((context.to_vec(), start_pos));
            Ok(replies.next().unwrap())
        })
        .unwrap();

        assert_eq!(generated, 3);
        assert_eq!(tokens, [10, 11, 12, 5, 6, 2]);
        let expected: Vec<(Vec<u32>, usize)> = vec![(vec![10, 11, 12], 0), (vec![5], 3), (vec![6], 4)];
        assert_eq!(seen, expected);
    }

    #[test]
    fn sampling_respects_max_length() {
        let mut tokens = vec![1];
        let generated = sample_until_eos(&mut tokens, 4, 2, |_, _| Ok(9)).unwrap();
        assert_eq!(generated, 4);
        assert_eq!(tokens, [1, 9, 9, 9, 9]);
    }

    #[test]
    fn sampling_errors_propagate() {
        let mut tokens = vec![1];
        let result = sample_until_eos(&mut tokens, 4, 2, |_, _| bail!("device lost"));
        assert!(result.is_err());
        assert_eq!(tokens, [1]);
    }

    #[test]
    fn context_window_must_hold_prompt_and_reply() {
        assert!(check_context_window(1024, 2048, 16384).is_ok());
        assert!(check_context_window(1024, 2048, 3072).is_ok());
        let err = check_context_window(1024, 2048, 2048).unwrap_err();
        assert!(err.to_string().contains("2048 tokens"));
    }

    #[test]
    fn small_context_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            serde_json::json!({
                "hidden_size": 8,
                "intermediate_size": 16,
                "vocab_size": 10,
                "num_hidden_layers": 1,
                "num_attention_heads": 2,
                "rms_norm_eps": 1e-6,
                "max_position_embeddings": 2048,
                "eos_token_id": 2
            })
            .to_string(),
        )
        .unwrap();

        let err = TextGeneratorPipeline::from_local_dir(dir.path(), &Device::Cpu, 1024, 2048)
            .err()
            .unwrap();
        assert!(err.to_string().contains("max_length_ceiling"));
    }
}
