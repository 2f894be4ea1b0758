use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;

/// Body of `POST /chat`.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub prompt: Option<String>,
}

impl ChatRequest {
    /// Parses and validates a raw body, returning the prompt.
    pub fn prompt_from_body(body: &[u8]) -> Result<String, DecodeError> {
        let request: ChatRequest = serde_json::from_slice(body)
            .map_err(|_| DecodeError::validation("Invalid JSON payload"))?;
        match request.prompt {
            Some(prompt) if !prompt.trim().is_empty() => Ok(prompt),
            _ => Err(DecodeError::validation("Prompt is required")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn from_error(err: &DecodeError) -> Self {
        let error = match err {
            DecodeError::NotReady => "Model not ready".to_string(),
            DecodeError::Validation(msg) => msg.clone(),
            other => other.to_string(),
        };
        Self { error }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthBody {
    pub status: String,
    pub context_length: Option<usize>,
    pub requests: u64,
    pub failures: u64,
    pub tokens_generated: u64,
}

pub const INDEX_HTML: &str = r#"<h1>Hello World!</h1>
<p>Server is running. Make a POST request to /chat with a "prompt" field to stream a reply.</p>
<p>Example curl request:</p>
<pre>
curl -N -X POST http://localhost:8000/chat \
     -H "Content-Type: application/json" \
     -d '{"prompt": "Tell me a joke"}'
</pre>
"#;
