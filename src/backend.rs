use std::ops::Range;
use std::path::Path;

use anyhow::{bail, Context, Error as E, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;
use tracing::debug;

use crate::prompting::{GenerationConfig, PromptFamily};

/// Compute collaborator driven by the decode controller.
///
/// `prefill` consumes the whole input and returns the first decode position;
/// `step` produces the token for `position` given everything committed before it.
pub trait InferencePipeline: Send {
    fn prefill(&mut self, tokens: &[u32]) -> Result<usize>;
    fn step(&mut self, tokens: &[u32], position: usize) -> Result<u32>;
}

pub enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeModel {
    /// Reads `model_path` and builds the weights for the configured `family`.
    pub fn load_from_gguf(path: &Path, family: PromptFamily, device: &Device) -> Result<Self> {
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("model_path {} cannot be opened", path.display()))?;
        let content = gguf_file::Content::read(&mut file)
            .with_context(|| format!("model_path {} is not a GGUF file", path.display()))?;

        let model = match family {
            // Mistral exports share the llama tensor names.
            PromptFamily::Llama | PromptFamily::Mistral => Self::Llama(
                quantized_llama::ModelWeights::from_gguf(content, &mut file, device)
                    .map_err(|e| weights_error(e, path))?,
            ),
            PromptFamily::Qwen => Self::Qwen2(
                quantized_qwen2::ModelWeights::from_gguf(content, &mut file, device)
                    .map_err(|e| weights_error(e, path))?,
            ),
            PromptFamily::Unknown => bail!(
                "no architecture matches {}; set `family` to llama, qwen or mistral",
                path.display()
            ),
        };
        Ok(model)
    }

    pub fn forward(&mut self, input_tensor: &Tensor, position: usize) -> Result<Tensor> {
        match self {
            Self::Llama(model) => Ok(model.forward(input_tensor, position)?),
            Self::Qwen2(model) => Ok(model.forward(input_tensor, position)?),
        }
    }
}

/// GGUF model plus the KV bookkeeping needed to honour prefill/step.
pub struct CandlePipeline {
    model: RuntimeModel,
    device: Device,
    generation: GenerationConfig,
    sampler: LogitsProcessor,
    batch_size: usize,
    /// Tokens already folded into the model's KV cache.
    cached: usize,
    /// Logits predicting the token at position `cached`.
    pending: Option<Tensor>,
}

impl CandlePipeline {
    pub fn new(model: RuntimeModel, device: Device, generation: GenerationConfig, batch_size: usize) -> Self {
        let sampler = build_sampler(&generation);
        Self {
            model,
            device,
            generation,
            sampler,
            batch_size: batch_size.max(1),
            cached: 0,
            pending: None,
        }
    }

    /// Runs the model over `tokens`, which continue the cache at `self.cached`.
    fn feed(&mut self, tokens: &[u32]) -> Result<()> {
        let start = self.cached;
        for span in forward_spans(start, start + tokens.len(), self.batch_size) {
            let chunk = &tokens[span.start - start..span.end - start];
            let input = Tensor::new(chunk, &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, self.cached)?;
            self.cached = span.end;
            self.pending = Some(logits.squeeze(0)?.to_dtype(DType::F32)?);
        }
        Ok(())
    }
}

/// Forward passes covering positions `start..end`.
///
/// The quantized models build a square causal mask, so a multi-token pass is
/// only valid on an empty cache: position 0 takes up to `batch_size` tokens,
/// every later position goes through alone.
fn forward_spans(start: usize, end: usize, batch_size: usize) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut next = start;
    if next == 0 && end > 0 {
        next = end.min(batch_size.max(1));
        spans.push(0..next);
    }
    spans.extend((next..end).map(|p| p..p + 1));
    spans
}

impl InferencePipeline for CandlePipeline {
    fn prefill(&mut self, tokens: &[u32]) -> Result<usize> {
        if tokens.is_empty() {
            bail!("prefill needs at least one token");
        }
        // position 0 makes the candle models drop their previous KV cache
        self.cached = 0;
        self.pending = None;
        self.sampler = build_sampler(&self.generation);
        self.feed(tokens).context("prefill forward pass")?;
        debug!(tokens = tokens.len(), batch_size = self.batch_size, "prefill complete");
        Ok(tokens.len())
    }

    fn step(&mut self, tokens: &[u32], position: usize) -> Result<u32> {
        if position == 0 || position > tokens.len() {
            bail!(
                "decode position {} outside committed range 1..={}",
                position,
                tokens.len()
            );
        }
        if position < self.cached {
            // The slot was rewritten; rebuild the cache from the start.
            self.cached = 0;
            self.pending = None;
        }
        if self.cached < position {
            self.feed(&tokens[self.cached..position])
                .with_context(|| format!("forward pass at position {}", position))?;
        }
        let logits = self
            .pending
            .take()
            .ok_or_else(|| E::msg(format!("no logits available for position {}", position)))?;
        Ok(self.sampler.sample(&logits)?)
    }
}

fn weights_error(err: candle_core::Error, path: &Path) -> E {
    let text = err.to_string();
    if text.contains("cannot find tensor info") {
        E::msg(format!(
            "{} lacks required tensors ({}); point model_path at a complete single-file GGUF",
            path.display(),
            text
        ))
    } else {
        E::new(err).context(format!("building weights from {}", path.display()))
    }
}

fn build_sampler(cfg: &GenerationConfig) -> LogitsProcessor {
    let temperature = if cfg.temperature <= 0.0 {
        None
    } else {
        Some(cfg.temperature)
    };
    let top_p = if cfg.top_p <= 0.0 || cfg.top_p >= 1.0 {
        None
    } else {
        Some(cfg.top_p)
    };
    LogitsProcessor::new(cfg.seed.unwrap_or_else(random_seed), temperature, top_p)
}

fn random_seed() -> u64 {
    let mut buf = [0u8; 8];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(_) => 299_792_458,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use candle_core::quantized::gguf_file::Value;
    use candle_core::quantized::{GgmlDType, QTensor};

    use super::*;

    const VOCAB: usize = 32;
    const HIDDEN: usize = 8;
    const FFN: usize = 16;

    /// One-block llama with random f32 weights, written as GGUF to a temp file.
    fn tiny_llama_gguf(tag: &str) -> PathBuf {
        let device = Device::Cpu;
        let weight = |shape: (usize, usize)| {
            let t = Tensor::randn(0f32, 0.1, shape, &device).expect("randn");
            QTensor::quantize(&t, GgmlDType::F32).expect("quantize")
        };
        let norm = || {
            let t = Tensor::ones(HIDDEN, DType::F32, &device).expect("ones");
            QTensor::quantize(&t, GgmlDType::F32).expect("quantize")
        };
        let tensors = vec![
            ("token_embd.weight", weight((VOCAB, HIDDEN))),
            ("output_norm.weight", norm()),
            ("output.weight", weight((VOCAB, HIDDEN))),
            ("blk.0.attn_q.weight", weight((HIDDEN, HIDDEN))),
            ("blk.0.attn_k.weight", weight((HIDDEN, HIDDEN))),
            ("blk.0.attn_v.weight", weight((HIDDEN, HIDDEN))),
            ("blk.0.attn_output.weight", weight((HIDDEN, HIDDEN))),
            ("blk.0.ffn_gate.weight", weight((FFN, HIDDEN))),
            ("blk.0.ffn_up.weight", weight((FFN, HIDDEN))),
            ("blk.0.ffn_down.weight", weight((HIDDEN, FFN))),
            ("blk.0.attn_norm.weight", norm()),
            ("blk.0.ffn_norm.weight", norm()),
        ];
        let metadata = vec![
            ("llama.attention.head_count", Value::U32(2)),
            ("llama.attention.head_count_kv", Value::U32(2)),
            ("llama.block_count", Value::U32(1)),
            ("llama.embedding_length", Value::U32(HIDDEN as u32)),
            ("llama.rope.dimension_count", Value::U32((HIDDEN / 2) as u32)),
            ("llama.attention.layer_norm_rms_epsilon", Value::F32(1e-5)),
        ];

        let path = std::env::temp_dir().join(format!(
            "decode_stream_llama_{}_{}_{}.gguf",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        ));
        let mut file = std::fs::File::create(&path).expect("create gguf");
        let metadata: Vec<(&str, &Value)> = metadata.iter().map(|(k, v)| (*k, v)).collect();
        let tensors: Vec<(&str, &QTensor)> = tensors.iter().map(|(k, t)| (*k, t)).collect();
        gguf_file::write(&mut file, &metadata, &tensors).expect("write gguf");
        path
    }

    fn greedy() -> GenerationConfig {
        GenerationConfig {
            temperature: 0.0,
            top_p: 0.9,
            seed: Some(1),
        }
    }

    #[test]
    fn multi_token_passes_only_start_at_position_zero() {
        assert_eq!(forward_spans(0, 5, 2), vec![0..2, 2..3, 3..4, 4..5]);
        assert_eq!(forward_spans(0, 3, 64), vec![0..3]);
        assert_eq!(forward_spans(7, 9, 64), vec![7..8, 8..9]);
        assert!(forward_spans(0, 0, 4).is_empty());
    }

    #[test]
    fn prefill_longer_than_batch_size_runs_on_quantized_llama() {
        let path = tiny_llama_gguf("prefill");
        let model = RuntimeModel::load_from_gguf(&path, PromptFamily::Llama, &Device::Cpu)
            .expect("load tiny llama");
        let mut pipeline = CandlePipeline::new(model, Device::Cpu, greedy(), 16);

        let tokens: Vec<u32> = (0..100).map(|i| (i % VOCAB) as u32).collect();
        assert_eq!(pipeline.prefill(&tokens).expect("prefill past one batch"), 100);
        let next = pipeline.step(&tokens, 100).expect("step after prefill");
        assert!((next as usize) < VOCAB);

        // rewinding inside the cache rebuilds it through the same passes
        let rewound = pipeline.step(&tokens, 50).expect("step after rewind");
        assert!((rewound as usize) < VOCAB);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn zero_temperature_samples_greedily() {
        let mut sampler = build_sampler(&greedy());
        let logits = Tensor::new(&[0.1f32, 3.0, 0.2, -1.0], &Device::Cpu).expect("tensor");
        assert_eq!(sampler.sample(&logits).expect("sample"), 1);
    }

    #[test]
    fn missing_model_file_names_the_config_key() {
        let err = RuntimeModel::load_from_gguf(
            Path::new("/nonexistent/llama.gguf"),
            PromptFamily::Llama,
            &Device::Cpu,
        )
        .err()
        .expect("load must fail");
        let text = err.to_string();
        assert!(text.contains("model_path"));
        assert!(text.contains("/nonexistent/llama.gguf"));
    }

    #[test]
    fn unknown_family_asks_for_family_key() {
        let path = tiny_llama_gguf("unknown");
        let err = RuntimeModel::load_from_gguf(&path, PromptFamily::Unknown, &Device::Cpu)
            .err()
            .expect("unknown family");
        assert!(err.to_string().contains("`family`"));
        let _ = std::fs::remove_file(path);
    }
}
