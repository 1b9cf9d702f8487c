use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::generation::{GenerationOutput, Generator};

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    batch_size: usize,
}

impl OllamaClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client for ollama")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            batch_size: batch_size.max(1),
        })
    }

    /// Raw completion: the prompt is sent verbatim, bypassing the model's chat template.
    pub async fn generate_text(
        &self,
        prompt: &str,
        num_predict: usize,
        temperature: f32,
    ) -> Result<String> {
        #[derive(Serialize)]
        struct GenerateReq<'a> {
            model: &'a str,
            prompt: &'a str,
            raw: bool,
            stream: bool,
            options: GenerateOptions,
        }

        #[derive(Serialize)]
        struct GenerateOptions {
            num_predict: usize,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct GenerateResp {
            response: String,
        }

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&GenerateReq {
                model: &self.model,
                prompt,
                raw: true,
                stream: false,
                options: GenerateOptions {
                    num_predict,
                    temperature,
                },
            })
            .send()
            .await
            .context("failed to call ollama generate endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "ollama /api/generate returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let response = response
            .json::<GenerateResp>()
            .await
            .context("failed to decode ollama generate response")?;

        Ok(response.response)
    }
}

impl Generator for OllamaClient {
    /// Answers carry the prompt in front of the completion, so the role marker
    /// that closes the prompt separates echo from generation.
    async fn generate(
        &self,
        prompts: &[String],
        max_new_tokens: usize,
        temperature: f32,
    ) -> Result<Vec<GenerationOutput>> {
        tracing::debug!(
            prompts = prompts.len(),
            model = %self.model,
            concurrency = self.batch_size,
            "dispatching ollama batch"
        );
        stream::iter(prompts.iter().enumerate())
            .map(|(index, prompt)| async move {
                let completion = self
                    .generate_text(prompt, max_new_tokens, temperature)
                    .await
                    .with_context(|| format!("generation failed for prompt {index}"))?;
                Ok::<_, anyhow::Error>(GenerationOutput::Text(format!("{prompt}{completion}")))
            })
            .buffered(self.batch_size)
            .try_collect()
            .await
    }
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
    }

    trimmed.to_string()
}
