//! Hugging Face text-generation inference endpoint.
//!
//! Sends the whole batch as `inputs` and asks for the full text back, so every
//! answer still carries the prompt and its role marker.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;

use crate::generation::{GenerationOutput, Generator};

#[derive(Clone)]
pub struct HfInferenceClient {
    client: Client,
    endpoint: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a [String],
    parameters: InferenceParameters,
}

#[derive(Serialize)]
struct InferenceParameters {
    max_new_tokens: usize,
    temperature: f32,
    do_sample: bool,
    return_full_text: bool,
}

impl HfInferenceClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client for inference endpoint")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_token,
        })
    }
}

impl Generator for HfInferenceClient {
    async fn generate(
        &self,
        prompts: &[String],
        max_new_tokens: usize,
        temperature: f32,
    ) -> Result<Vec<GenerationOutput>> {
        let body = InferenceRequest {
            inputs: prompts,
            parameters: InferenceParameters {
                max_new_tokens,
                temperature,
                do_sample: temperature > 0.0,
                return_full_text: true,
            },
        };

        tracing::debug!(prompts = prompts.len(), endpoint = %self.endpoint, "dispatching inference batch");
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .context("failed to call inference endpoint")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("inference endpoint returned {status}: {}", body.trim());
        }

        let text = response
            .text()
            .await
            .context("failed to read inference response")?;
        parse_batch_response(&text)
    }
}

/// A batch answer is a JSON list with one entry per prompt; a single object is
/// accepted for one-prompt batches.
fn parse_batch_response(body: &str) -> Result<Vec<GenerationOutput>> {
    let output: GenerationOutput =
        serde_json::from_str(body).context("failed to decode inference response")?;
    Ok(match output {
        GenerationOutput::Batch(items) => items,
        single => vec![single],
    })
}
