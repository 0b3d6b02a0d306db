//! Phi-3 chat engine over ONNX Runtime.
//!
//! Loads the quantized Phi-3 graph plus its tokenizer from one flat model
//! directory and greedy-decodes replies, reusing the graph's KV-cache
//! inputs when the export provides them.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::ValueType;
use ort::value::{DynTensor, DynTensorValueType, DynValue, Tensor};
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::{ChatEngine, ChatTurn, EngineError, EngineLoader, GenerateOptions, Result, Role};

const DEFAULT_CONTEXT_LENGTH: usize = 4096;

/// Stop markers merged into the eos set when the tokenizer knows them.
const STOP_MARKERS: [&str; 2] = ["<|end|>", "<|endoftext|>"];

/// Subset of `genai_config.json` the engine cares about. The file ships with
/// the model and names the graph file, context window, and stop token ids.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GenAiConfig {
    pub(crate) model: GenAiModelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GenAiModelConfig {
    #[serde(default)]
    pub(crate) context_length: Option<usize>,
    #[serde(default)]
    pub(crate) eos_token_id: Option<EosIds>,
    #[serde(default)]
    pub(crate) decoder: Option<GenAiDecoderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GenAiDecoderConfig {
    #[serde(default)]
    pub(crate) filename: Option<String>,
}

/// Upstream writes either a single id or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum EosIds {
    One(u32),
    Many(Vec<u32>),
}

impl GenAiConfig {
    pub(crate) fn eos_ids(&self) -> Vec<u32> {
        match &self.model.eos_token_id {
            None => Vec::new(),
            Some(EosIds::One(id)) => vec![*id],
            Some(EosIds::Many(ids)) => ids.clone(),
        }
    }

    pub(crate) fn context_length(&self) -> usize {
        self.model.context_length.unwrap_or(DEFAULT_CONTEXT_LENGTH)
    }
}

fn read_genai_config(model_dir: &Path) -> Result<GenAiConfig> {
    let path = model_dir.join("genai_config.json");
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
}

/// Graph file named by the config, else the first `.onnx` sibling.
fn resolve_graph_path(model_dir: &Path, config: &GenAiConfig) -> Result<PathBuf> {
    if let Some(name) = config
        .model
        .decoder
        .as_ref()
        .and_then(|d| d.filename.as_deref())
    {
        return Ok(model_dir.join(name));
    }

    let entries =
        std::fs::read_dir(model_dir).map_err(|e| EngineError::Model(e.to_string()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "onnx") {
            return Ok(path);
        }
    }
    Err(EngineError::Model(format!(
        "no .onnx graph in {}",
        model_dir.display()
    )))
}

/// Phi-3 instruct chat template.
fn build_prompt(turns: &[ChatTurn]) -> String {
    let mut prompt = String::new();
    for turn in turns {
        let tag = match turn.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        prompt.push_str("<|");
        prompt.push_str(tag);
        prompt.push_str("|>\n");
        prompt.push_str(&turn.text);
        prompt.push_str("<|end|>\n");
    }
    prompt.push_str("<|assistant|>\n");
    prompt
}

#[derive(Debug, Clone, Copy)]
enum PastElemType {
    F16,
    F32,
}

#[derive(Debug, Clone)]
struct EmptyPastSpec {
    elem: PastElemType,
    shape: Vec<i64>,
}

fn guess_past_seq_dim(dims: &[i64], symbols: Option<&[String]>) -> usize {
    if let Some(symbols) = symbols {
        for (i, sym) in symbols.iter().enumerate() {
            let s = sym.to_lowercase();
            if s.contains("past") || s.contains("seq") || s.contains("sequence") {
                return i;
            }
        }
    }
    // Heuristic: sequence/past length is usually the last dynamic dimension (-1).
    dims.iter()
        .enumerate()
        .rev()
        .find(|(_, d)| **d < 0)
        .map(|(i, _)| i)
        .unwrap_or_else(|| dims.len().saturating_sub(1))
}

fn build_empty_past_spec(value_type: &ValueType) -> Option<EmptyPastSpec> {
    let ValueType::Tensor {
        ty,
        shape,
        dimension_symbols,
    } = value_type
    else {
        return None;
    };

    let elem = match ty {
        ort::tensor::TensorElementType::Float16 => PastElemType::F16,
        ort::tensor::TensorElementType::Float32 => PastElemType::F32,
        _ => return None,
    };

    let mut dims: Vec<i64> = shape.iter().copied().collect();
    let symbols: &[String] = dimension_symbols.as_ref();
    let symbols_opt: Option<&[String]> = if symbols.is_empty() {
        None
    } else {
        Some(symbols)
    };
    let seq_dim = guess_past_seq_dim(&dims, symbols_opt);

    for d in dims.iter_mut() {
        if *d < 0 {
            *d = 1;
        }
    }
    if seq_dim < dims.len() {
        // `Tensor::from_array` rejects zero-sized dimensions, so an empty
        // cache is primed with a single masked timestep instead; the matching
        // attention mask position stays 0 and is never attended to.
        dims[seq_dim] = 1;
    }

    Some(EmptyPastSpec { elem, shape: dims })
}

fn empty_past_tensor(spec: &EmptyPastSpec) -> Result<DynTensor> {
    let numel = spec
        .shape
        .iter()
        .copied()
        .fold(1i64, |acc, d| acc.saturating_mul(d.max(0))) as usize;
    let tensor = match spec.elem {
        PastElemType::F32 => Tensor::<f32>::from_array((spec.shape.clone(), vec![0f32; numel]))
            .map_err(|e| EngineError::Generation(e.to_string()))?
            .upcast(),
        PastElemType::F16 => Tensor::<half::f16>::from_array((
            spec.shape.clone(),
            vec![half::f16::from_f32(0.0); numel],
        ))
        .map_err(|e| EngineError::Generation(e.to_string()))?
        .upcast(),
    };
    Ok(tensor)
}

#[derive(Debug)]
pub struct PhiEngine {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    model_id: String,
    input_names: Vec<String>,
    output_name: String,
    past_input_names: Vec<String>,
    present_output_names: Vec<String>,
    empty_past_specs: Vec<Option<EmptyPastSpec>>,
    eos_token_ids: Vec<u32>,
    context_length: usize,
}

impl PhiEngine {
    pub fn load(model_id: &str, model_dir: &Path) -> Result<Self> {
        let config = read_genai_config(model_dir)?;
        let graph_path = resolve_graph_path(model_dir, &config)?;

        let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;

        let session = Session::builder()
            .map_err(|e| EngineError::Model(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| EngineError::Model(e.to_string()))?
            .commit_from_file(&graph_path)
            .map_err(|e| EngineError::Model(e.to_string()))?;

        let input_names = session
            .inputs
            .iter()
            .map(|i| i.name.clone())
            .collect::<Vec<_>>();
        let output_names = session
            .outputs
            .iter()
            .map(|o| o.name.clone())
            .collect::<Vec<_>>();
        let output_name = output_names
            .iter()
            .find(|n| n.as_str() == "logits")
            .cloned()
            .or_else(|| output_names.first().cloned())
            .ok_or_else(|| EngineError::Model("model has no outputs".to_string()))?;

        let mut past_input_names = Vec::new();
        let mut present_output_names = Vec::new();
        let mut empty_past_specs: Vec<Option<EmptyPastSpec>> = Vec::new();
        for input in &session.inputs {
            if input.name.starts_with("past_key_values.") {
                past_input_names.push(input.name.clone());
                present_output_names.push(input.name.replacen("past_key_values", "present", 1));
                let spec = build_empty_past_spec(&input.input_type);
                if spec.is_none() {
                    tracing::warn!(
                        past_input = %input.name,
                        input_type = ?input.input_type,
                        "unable to infer past KV empty shape; inference may fail"
                    );
                }
                empty_past_specs.push(spec);
            }
        }

        let mut eos_token_ids = config.eos_ids();
        for marker in STOP_MARKERS {
            if let Some(id) = tokenizer.token_to_id(marker) {
                if !eos_token_ids.contains(&id) {
                    eos_token_ids.push(id);
                }
            }
        }

        tracing::info!(
            model_id,
            graph = %graph_path.display(),
            model_inputs = input_names.len(),
            past_kv_inputs = past_input_names.len(),
            eos_tokens = ?eos_token_ids,
            context_length = config.context_length(),
            "chat model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            model_id: model_id.to_string(),
            input_names,
            output_name,
            past_input_names,
            present_output_names,
            empty_past_specs,
            eos_token_ids,
            context_length: config.context_length(),
        })
    }

    fn decode_clean(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))
    }

    fn generate_text(
        &self,
        prompt: &str,
        max_new_tokens: usize,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;

        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let mut attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| m as i64)
            .collect();

        // Keep the prompt inside the context window, leaving room to reply.
        let max_prompt_tokens = self
            .context_length
            .saturating_sub(max_new_tokens)
            .max(16);
        if input_ids.len() > max_prompt_tokens {
            let start = input_ids.len() - max_prompt_tokens;
            input_ids = input_ids[start..].to_vec();
            attention_mask = attention_mask[start..].to_vec();
        }

        let mut generated: Vec<u32> = Vec::new();
        let mut decoded = String::new();
        let mut emitted = String::new();

        // If the ONNX export exposes KV cache inputs, use them.
        let use_kv_cache = !self.past_input_names.is_empty()
            && self.past_input_names.len() == self.present_output_names.len()
            && self.empty_past_specs.len() == self.past_input_names.len()
            && self.empty_past_specs.iter().all(|s| s.is_some());
        let past_prefix_len: usize = if use_kv_cache { 1 } else { 0 };
        let position_offset: i64 = past_prefix_len as i64;
        tracing::debug!(use_kv_cache, prompt_tokens = input_ids.len(), "generate");

        // Initial past: primed tensors with a single masked timestep.
        let mut past: Vec<DynTensor> = Vec::new();
        if use_kv_cache {
            for spec in self.empty_past_specs.iter().filter_map(|s| s.as_ref()) {
                past.push(empty_past_tensor(spec)?);
            }
        }

        let mut total_len = input_ids.len();

        for step in 0..max_new_tokens {
            let is_first = step == 0 || !use_kv_cache;

            let (step_ids, step_positions) = if is_first {
                (
                    input_ids.clone(),
                    (position_offset..position_offset + total_len as i64).collect::<Vec<i64>>(),
                )
            } else {
                let last = *input_ids.last().ok_or(EngineError::InvalidOutput)?;
                (vec![last], vec![position_offset + (total_len as i64) - 1])
            };

            let ids_tensor = Tensor::<i64>::from_array(([1usize, step_ids.len()], step_ids))
                .map_err(|e| EngineError::Generation(e.to_string()))?;
            let mask: Vec<i64> = if past_prefix_len == 0 {
                attention_mask.clone()
            } else {
                let mut m = Vec::with_capacity(total_len + past_prefix_len);
                m.extend(std::iter::repeat_n(0i64, past_prefix_len));
                m.extend(attention_mask.iter().copied());
                m
            };
            let mask_tensor = Tensor::<i64>::from_array(([1usize, mask.len()], mask))
                .map_err(|e| EngineError::Generation(e.to_string()))?;
            let pos_tensor =
                Tensor::<i64>::from_array(([1usize, step_positions.len()], step_positions))
                    .map_err(|e| EngineError::Generation(e.to_string()))?;

            let mut inputs: Vec<(String, DynTensor)> = Vec::new();
            inputs.push(("input_ids".to_string(), ids_tensor.upcast()));
            if self.input_names.iter().any(|n| n == "attention_mask") {
                inputs.push(("attention_mask".to_string(), mask_tensor.upcast()));
            }
            if self.input_names.iter().any(|n| n == "position_ids") {
                inputs.push(("position_ids".to_string(), pos_tensor.upcast()));
            }

            if use_kv_cache {
                let past_to_use = std::mem::take(&mut past);
                for (name, tensor) in self
                    .past_input_names
                    .iter()
                    .cloned()
                    .zip(past_to_use.into_iter())
                {
                    inputs.push((name, tensor));
                }
            }

            let mut session = self
                .session
                .lock()
                .map_err(|_| EngineError::Generation("model session lock poisoned".to_string()))?;

            let mut outputs = session
                .run(inputs)
                .map_err(|e| EngineError::Generation(e.to_string()))?;

            // Take logits out of the map so the KV outputs can be removed
            // afterwards without borrow conflicts.
            let logits_value: DynValue = outputs
                .remove(self.output_name.as_str())
                .ok_or(EngineError::InvalidOutput)?;
            let (shape, data) = logits_value
                .try_extract_tensor::<f32>()
                .map_err(|e| EngineError::Generation(e.to_string()))?;

            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            if dims.len() < 2 {
                return Err(EngineError::InvalidOutput);
            }
            let vocab = *dims.last().ok_or(EngineError::InvalidOutput)?;
            if vocab == 0 || data.len() < vocab {
                return Err(EngineError::InvalidOutput);
            }
            // Logits come back as [batch, seq, vocab] with batch 1; the last
            // vocab-wide row belongs to the final position either way.
            let last_logits: Vec<f32> = data[data.len() - vocab..].to_vec();

            if use_kv_cache {
                let mut next_past = Vec::with_capacity(self.present_output_names.len());
                for present_name in &self.present_output_names {
                    let v: DynValue = outputs
                        .remove(present_name.as_str())
                        .ok_or(EngineError::InvalidOutput)?;
                    let t: DynTensor = v
                        .downcast::<DynTensorValueType>()
                        .map_err(|e| EngineError::Generation(e.to_string()))?;
                    next_past.push(t);
                }
                past = next_past;
            }

            // Greedy argmax.
            let mut best_id: u32 = 0;
            let mut best_val: f32 = f32::NEG_INFINITY;
            for (i, v) in last_logits.iter().enumerate() {
                if *v > best_val {
                    best_val = *v;
                    best_id = i as u32;
                }
            }

            if self.eos_token_ids.contains(&best_id) {
                break;
            }

            generated.push(best_id);
            input_ids.push(best_id as i64);
            attention_mask.push(1);
            total_len += 1;

            decoded = self.decode_clean(&generated)?;

            // Token boundaries may rewrite the decoded tail (multi-byte
            // pieces); only stream once the prior emission is a stable prefix.
            if decoded.len() > emitted.len() && decoded.starts_with(emitted.as_str()) {
                on_token(&decoded[emitted.len()..]);
                emitted = decoded.clone();
            }
        }

        Ok(decoded)
    }
}

impl ChatEngine for PhiEngine {
    fn generate(
        &self,
        turns: &[ChatTurn],
        options: &GenerateOptions,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String> {
        let prompt = build_prompt(turns);
        let reply = self.generate_text(&prompt, options.max_new_tokens, on_token)?;
        Ok(reply.trim().to_string())
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

/// Loader for quantized Phi-3 ONNX exports.
pub struct PhiEngineLoader;

impl EngineLoader for PhiEngineLoader {
    fn name(&self) -> &str {
        "Phi-3 ONNX"
    }

    fn can_load(&self, model_id: &str) -> bool {
        model_id.starts_with("phi-3")
    }

    fn load(&self, model_id: &str, model_dir: &Path) -> Result<Box<dyn ChatEngine>> {
        let engine = PhiEngine::load(model_id, model_dir)?;
        Ok(Box::new(engine))
    }
}
