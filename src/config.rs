use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::sanitize::MarkerPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    Ollama,
    Hf,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Backend::Ollama),
            "hf" | "huggingface" => Ok(Backend::Hf),
            other => Err(format!("unknown generation backend: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub backend: Backend,
    pub model: String,
    pub ollama_base_url: String,
    pub hf_inference_url: String,
    pub hf_api_token: Option<String>,
    pub batch_size: usize,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct RevisionConfig {
    pub max_lines: usize,
    pub first_pass_temperature: f32,
    pub retry_temperature: f32,
    pub min_new_tokens: usize,
    pub max_new_tokens: usize,
    pub long_block_tokens: usize,
    pub long_block_margin: f32,
    pub min_length_ratio: f32,
    pub marker_policy: MarkerPolicy,
}

impl Default for RevisionConfig {
    fn default() -> Self {
        Self {
            max_lines: 7,
            first_pass_temperature: 0.7,
            retry_temperature: 0.3,
            min_new_tokens: 128,
            max_new_tokens: 768,
            long_block_tokens: 200,
            long_block_margin: 1.2,
            min_length_ratio: 0.5,
            marker_policy: MarkerPolicy::Require,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub models: ModelConfig,
    pub revision: RevisionConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env::var("REVISER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let defaults = RevisionConfig::default();

        Self {
            data_dir,
            models: ModelConfig {
                backend: parsed("REVISER_BACKEND").unwrap_or(Backend::Ollama),
                model: env::var("REVISER_MODEL")
                    .unwrap_or_else(|_| "openhermes:7b-mistral-v2.5-q4_K_M".to_string()),
                ollama_base_url: env::var("OLLAMA_BASE_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
                hf_inference_url: env::var("HF_INFERENCE_URL").unwrap_or_else(|_| {
                    "https://api-inference.huggingface.co/models/teknium/OpenHermes-2.5-Mistral-7B"
                        .to_string()
                }),
                hf_api_token: env::var("HF_API_TOKEN").ok().filter(|token| !token.is_empty()),
                batch_size: parsed("REVISER_BATCH_SIZE").unwrap_or(4),
                request_timeout_secs: parsed("REVISER_REQUEST_TIMEOUT_SECS").unwrap_or(600),
            },
            revision: RevisionConfig {
                max_lines: parsed("REVISER_MAX_LINES").unwrap_or(defaults.max_lines),
                first_pass_temperature: parsed("REVISER_TEMPERATURE")
                    .unwrap_or(defaults.first_pass_temperature),
                retry_temperature: parsed("REVISER_RETRY_TEMPERATURE")
                    .unwrap_or(defaults.retry_temperature),
                min_length_ratio: parsed("REVISER_MIN_LENGTH_RATIO")
                    .unwrap_or(defaults.min_length_ratio),
                marker_policy: match env::var("REVISER_LENIENT_MARKER").as_deref() {
                    Ok("1") | Ok("true") => MarkerPolicy::Lenient,
                    _ => MarkerPolicy::Require,
                },
                ..defaults
            },
        }
    }

    pub fn input_dir(&self) -> PathBuf {
        self.data_dir.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("output")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn parsed<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
