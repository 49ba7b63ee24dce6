use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use candle_core::Device;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::config::Config;
use crate::inference::chat_template::{extract_reply, format_prompt};
use crate::inference::model_config::SamplingParams;
use crate::inference::text_pipeline::{TextGenerator, TextGeneratorPipeline};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Local model not found: {}. Please ensure the model is downloaded to the local models directory.", .0.display())]
    ModelNotFound(PathBuf),
    #[error("Failed to load model from {}: {reason}", .path.display())]
    ModelLoad { path: PathBuf, reason: String },
    #[error("Model not loaded")]
    NotReady,
    #[error("{0}")]
    Generation(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Cuda,
    Metal,
    Cpu,
}

impl From<&Device> for DeviceKind {
    fn from(device: &Device) -> Self {
        if device.is_cuda() {
            DeviceKind::Cuda
        } else if device.is_metal() {
            DeviceKind::Metal
        } else {
            DeviceKind::Cpu
        }
    }
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cuda => write!(f, "cuda"),
            DeviceKind::Metal => write!(f, "metal"),
            DeviceKind::Cpu => write!(f, "cpu"),
        }
    }
}

/// Owns the one loaded model for the lifetime of the process.
pub struct ModelHost {
    model_id: String,
    device: DeviceKind,
    generator: Option<Arc<dyn TextGenerator>>,
    permits: Arc<Semaphore>,
}

impl ModelHost {
    /// A host with nothing attached yet. Generation fails with [`HostError::NotReady`] until a generator is attached.
    pub fn new(model_id: impl Into<String>, device: DeviceKind, max_concurrent: usize) -> Self {
        Self {
            model_id: model_id.into(),
            device,
            generator: None,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    #[tracing::instrument(level = "info", skip(config))]
    pub fn load(model_path: &Path, config: &Config) -> Result<Self, HostError> {
        if !model_path.exists() {
            return Err(HostError::ModelNotFound(model_path.to_path_buf()));
        }
        let load_error = |err: anyhow::Error| {
            error!("Error loading model: {err:#}");
            HostError::ModelLoad {
                path: model_path.to_path_buf(),
                reason: format!("{err:#}"),
            }
        };

        let device = select_device(config.cpu).map_err(load_error)?;
        info!("Loading from local path {} on {:?}", model_path.display(), device);
        let pipeline = TextGeneratorPipeline::from_local_dir(
            model_path,
            &device,
            config.max_input_tokens,
            config.max_length_ceiling,
        )
        .map_err(load_error)?;
        info!("Model loaded successfully");

        Ok(Self::new(
            model_path.display().to_string(),
            DeviceKind::from(&device),
            config.max_concurrent_generations,
        )
        .with_generator(Arc::new(pipeline)))
    }

    pub fn is_loaded(&self) -> bool {
        self.generator.is_some()
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Runs one chat turn and returns the trimmed assistant reply.
    #[tracing::instrument(level = "info", skip(self, message))]
    pub async fn generate(
        &self,
        message: &str,
        params: SamplingParams,
    ) -> Result<String, HostError> {
        let Some(generator) = self.generator.clone() else {
            return Err(HostError::NotReady);
        };
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| HostError::Generation(e.to_string()))?;

        let prompt = format_prompt(message);
        // The permit travels with the blocking work so a dropped request cannot free it early
        let generation = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            generator.generate(&prompt, &params)
        })
        .await
        .map_err(|e| HostError::Generation(e.to_string()))?
        .map_err(|e| {
            error!("Error generating response: {e:#}");
            HostError::Generation(format!("{e:#}"))
        })?;

        Ok(extract_reply(&generation.text, &generation.completion))
    }
}

/// Prefers CUDA, then Metal, then the CPU.
fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    if candle_core::utils::metal_is_available() {
        return Ok(Device::new_metal(0)?);
    }
    Ok(Device::Cpu)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::bail;

    use super::*;
    use crate::inference::chat_template::ASSISTANT_TURN;
    use crate::inference::text_pipeline::Generation;

    /// Answers every prompt with a fixed reply, echoing the prompt like a real decode would.
    pub(crate) struct StubGenerator {
        pub(crate) reply: String,
        pub(crate) calls: AtomicUsize,
        pub(crate) last_params: Mutex<Option<SamplingParams>>,
    }

    impl StubGenerator {
        pub(crate) fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                calls: AtomicUsize::new(0),
                last_params: Mutex::new(None),
            }
        }
    }

    impl TextGenerator for StubGenerator {
        fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<Generation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_params.lock().unwrap() = Some(*params);
            let completion = format!(" {}<|im_end|>", self.reply);
            Ok(Generation {
                text: format!("{prompt}{completion}"),
                completion,
            })
        }
    }

    pub(crate) struct FailingGenerator;

    impl TextGenerator for FailingGenerator {
        fn generate(&self, _prompt: &str, _params: &SamplingParams) -> Result<Generation> {
            bail!("CUDA out of memory")
        }
    }

    fn host_with(generator: Arc<dyn TextGenerator>) -> ModelHost {
        ModelHost::new("test-model", DeviceKind::Cpu, 1).with_generator(generator)
    }

    #[tokio::test]
    async fn generate_returns_extracted_reply() {
        let stub = Arc::new(StubGenerator::new("Hi there"));
        let host = host_with(stub.clone());

        let reply = host
            .generate("Hello", SamplingParams::default())
            .await
            .unwrap();
        assert_eq!(reply, "Hi there");
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *stub.last_params.lock().unwrap(),
            Some(SamplingParams::default())
        );
    }

    #[tokio::test]
    async fn generator_receives_templated_prompt() {
        struct PromptCheck;
        impl TextGenerator for PromptCheck {
            fn generate(&self, prompt: &str, _: &SamplingParams) -> Result<Generation> {
                assert!(prompt.ends_with(ASSISTANT_TURN));
                Ok(Generation {
                    text: prompt.to_string(),
                    completion: String::new(),
                })
            }
        }

        let reply = host_with(Arc::new(PromptCheck))
            .generate("Hello", SamplingParams::default())
            .await
            .unwrap();
        assert_eq!(reply, "");
    }

    #[tokio::test]
    async fn unloaded_host_is_not_ready() {
        let host = ModelHost::new("test-model", DeviceKind::Cpu, 1);
        assert!(!host.is_loaded());
        let err = host
            .generate("Hello", SamplingParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::NotReady));
    }

    #[tokio::test]
    async fn generator_failure_is_a_generation_error() {
        let err = host_with(Arc::new(FailingGenerator))
            .generate("Hello", SamplingParams::default())
            .await
            .unwrap_err();
        match err {
            HostError::Generation(message) => assert_eq!(message, "CUDA out of memory"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    /// Sleeps through each call and records how many calls overlapped.
    struct SlowGenerator {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl TextGenerator for SlowGenerator {
        fn generate(&self, prompt: &str, _params: &SamplingParams) -> Result<Generation> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(500));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Generation {
                text: prompt.to_string(),
                completion: String::new(),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aborted_request_keeps_its_permit_until_generation_ends() {
        let slow = Arc::new(SlowGenerator {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let host = Arc::new(host_with(slow.clone()));

        let first = {
            let host = host.clone();
            tokio::spawn(async move { host.generate("a", SamplingParams::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        host.generate("b", SamplingParams::default()).await.unwrap();
        assert_eq!(slow.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_model_path_is_model_not_found() {
        let config = Config::default();
        let err = ModelHost::load(Path::new("/nonexistent/model"), &config)
            .err()
            .unwrap();
        assert!(matches!(err, HostError::ModelNotFound(_)));
        assert!(err.to_string().contains("/nonexistent/model"));
    }

    #[test]
    fn empty_model_dir_is_model_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cpu = true;

        let err = ModelHost::load(dir.path(), &config).err().unwrap();
        assert!(matches!(err, HostError::ModelLoad { .. }));
    }

    #[test]
    fn device_kind_names() {
        assert_eq!(DeviceKind::Cpu.to_string(), "cpu");
        assert_eq!(DeviceKind::Cuda.to_string(), "cuda");
        assert_eq!(DeviceKind::from(&Device::Cpu), DeviceKind::Cpu);
    }
}
