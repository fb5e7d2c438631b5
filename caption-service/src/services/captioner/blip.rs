//! BLIP image captioning on candle.

use super::{CaptionError, Captioner};
use crate::config::{BlipVariant, ModelConfig};
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::blip::VisionConfig;
use candle_transformers::models::{blip, blip_text, quantized_blip};
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::{Repo, RepoType};
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::PathBuf;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tokio::sync::Mutex;

/// Square input resolution of the vision encoder.
const IMAGE_SIZE: u32 = 384;

const BOS_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;

const IMAGE_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const IMAGE_STD: [f32; 3] = [0.26862954, 0.261_302_6, 0.275_777_1];

fn blip_base_config() -> blip::Config {
    let text_config = blip_text::Config {
        vocab_size: 30524,
        hidden_size: 768,
        encoder_hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 768,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        max_position_embeddings: 512,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-12,
        is_decoder: true,
    };
    let vision_config = VisionConfig {
        hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 512,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        image_size: IMAGE_SIZE as usize,
        patch_size: 16,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-5,
    };

    blip::Config {
        text_config,
        vision_config,
        projection_dim: 512,
        image_text_hidden_size: 256,
    }
}

enum BlipModel {
    Full(blip::BlipForConditionalGeneration),
    Quantized(quantized_blip::BlipForConditionalGeneration),
}

impl BlipModel {
    fn embed_image(&self, pixels: &Tensor) -> candle_core::Result<Tensor> {
        let batch = pixels.unsqueeze(0)?;
        match self {
            BlipModel::Full(model) => batch.apply(model.vision_model()),
            BlipModel::Quantized(model) => batch.apply(model.vision_model()),
        }
    }

    fn decode_step(
        &mut self,
        input_ids: &Tensor,
        image_embeds: &Tensor,
    ) -> candle_core::Result<Tensor> {
        match self {
            BlipModel::Full(model) => model.text_decoder().forward(input_ids, image_embeds),
            BlipModel::Quantized(model) => model.text_decoder().forward(input_ids, image_embeds),
        }
    }

    fn reset_kv_cache(&mut self) {
        match self {
            BlipModel::Full(model) => model.text_decoder().reset_kv_cache(),
            BlipModel::Quantized(model) => model.text_decoder().reset_kv_cache(),
        }
    }
}

/// Everything mutated while decoding one caption.
struct BlipSession {
    model: BlipModel,
    tokenizer: Tokenizer,
    logits_processor: LogitsProcessor,
    device: Device,
    /// Total sequence length including the BOS prompt token.
    max_length: usize,
}

/// Tokens that may be generated after the BOS prompt within `max_length`.
fn new_token_budget(max_length: usize) -> usize {
    max_length.saturating_sub(1)
}

impl BlipSession {
    fn generate(&mut self, image: &DynamicImage) -> Result<String, CaptionError> {
        let pixels = preprocess(image)?.to_device(&self.device)?;
        let image_embeds = self.model.embed_image(&pixels)?;

        // the decoder keeps state from the previous request
        self.model.reset_kv_cache();

        let mut token_ids = vec![BOS_TOKEN_ID];
        for index in 0..new_token_budget(self.max_length) {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self.model.decode_step(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = self.logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }

        tracing::debug!(tokens = token_ids.len() - 1, "Caption decoded");

        let caption = self
            .tokenizer
            .decode(&token_ids, true)
            .map_err(|e| CaptionError::Inference(format!("Failed to detokenize caption: {}", e)))?;

        Ok(caption.trim().to_string())
    }
}

/// Stretch the whole frame to 384x384 (bicubic, no crop) and normalise to
/// the CLIP statistics BLIP was trained with. Returns a `(3, 384, 384)` f32
/// tensor on the CPU.
fn preprocess(image: &DynamicImage) -> candle_core::Result<Tensor> {
    let side = IMAGE_SIZE as usize;
    let img = image
        .resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::CatmullRom)
        .to_rgb8();
    let data = Tensor::from_vec(img.into_raw(), (side, side, 3), &Device::Cpu)?
        .permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)
}

fn select_device(force_cpu: bool) -> candle_core::Result<Device> {
    if force_cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)
    } else if candle_core::utils::metal_is_available() {
        Device::new_metal(0)
    } else {
        Ok(Device::Cpu)
    }
}

fn load_error(err: impl std::fmt::Display) -> CaptionError {
    CaptionError::ModelLoad(err.to_string())
}

/// Local paths win; anything missing is fetched from the hub cache.
async fn resolve_files(config: &ModelConfig) -> Result<(PathBuf, PathBuf), CaptionError> {
    if let (Some(weights), Some(tokenizer)) = (&config.weights_path, &config.tokenizer_path) {
        return Ok((weights.clone(), tokenizer.clone()));
    }

    let mut builder = ApiBuilder::new();
    if let Some(dir) = &config.cache_dir {
        builder = builder.with_cache_dir(dir.clone());
    }
    let api = builder.build().map_err(load_error)?;

    let weights = match &config.weights_path {
        Some(path) => path.clone(),
        None => {
            tracing::info!(
                repo = %config.repo,
                revision = %config.revision,
                file = %config.weights_file,
                "Fetching caption model weights"
            );
            api.repo(Repo::with_revision(
                config.repo.clone(),
                RepoType::Model,
                config.revision.clone(),
            ))
            .get(&config.weights_file)
            .await
            .map_err(load_error)?
        }
    };

    let tokenizer = match &config.tokenizer_path {
        Some(path) => path.clone(),
        None => api
            .model(config.tokenizer_repo.clone())
            .get("tokenizer.json")
            .await
            .map_err(load_error)?,
    };

    Ok((weights, tokenizer))
}

pub struct BlipCaptioner {
    name: String,
    session: Arc<Mutex<BlipSession>>,
}

impl BlipCaptioner {
    pub async fn load(config: &ModelConfig) -> Result<Self, CaptionError> {
        let (weights_path, tokenizer_path) = resolve_files(config).await?;

        let quantized = config.is_quantized();
        let model_config = match config.variant {
            BlipVariant::Base => blip_base_config(),
            BlipVariant::Large => blip::Config::image_captioning_large(),
        };
        let force_cpu = config.force_cpu;
        let seed = config.seed;
        let max_length = config.max_tokens;

        let session = tokio::task::spawn_blocking(move || -> Result<BlipSession, CaptionError> {
            let device = select_device(force_cpu).map_err(load_error)?;
            let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(load_error)?;

            let model = if quantized {
                let vb = quantized_blip::VarBuilder::from_gguf(&weights_path, &device)
                    .map_err(load_error)?;
                BlipModel::Quantized(
                    quantized_blip::BlipForConditionalGeneration::new(&model_config, vb)
                        .map_err(load_error)?,
                )
            } else {
                // SAFETY: the weights file is not modified while mapped.
                let vb = unsafe {
                    candle_nn::VarBuilder::from_mmaped_safetensors(
                        &[&weights_path],
                        DType::F32,
                        &device,
                    )
                }
                .map_err(load_error)?;
                BlipModel::Full(
                    blip::BlipForConditionalGeneration::new(&model_config, vb)
                        .map_err(load_error)?,
                )
            };

            tracing::info!(device = ?device, quantized, "Caption model loaded");

            Ok(BlipSession {
                model,
                tokenizer,
                // no temperature: greedy argmax decoding
                logits_processor: LogitsProcessor::new(seed, None, None),
                device,
                max_length,
            })
        })
        .await
        .map_err(load_error)??;

        let variant = match config.variant {
            BlipVariant::Base => "base",
            BlipVariant::Large => "large",
        };
        let name = if quantized {
            format!("blip-{}-quantized", variant)
        } else {
            format!("blip-{}", variant)
        };

        Ok(Self {
            name,
            session: Arc::new(Mutex::new(session)),
        })
    }
}

#[async_trait]
impl Captioner for BlipCaptioner {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn caption(&self, image: DynamicImage) -> Result<String, CaptionError> {
        let session = Arc::clone(&self.session);

        tokio::task::spawn_blocking(move || session.blocking_lock().generate(&image))
            .await
            .map_err(|e| CaptionError::Inference(format!("Inference task failed: {}", e)))?
    }

    async fn health_check(&self) -> Result<(), CaptionError> {
        // weights are loaded eagerly, so a constructed captioner is serviceable
        Ok(())
    }
}
