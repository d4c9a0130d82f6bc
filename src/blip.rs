use crate::{
    model::{CaptionRequest, CaptionResponse, InferenceModel},
    preprocess::image_to_tensor,
};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::{
    generation::LogitsProcessor,
    models::{blip, quantized_blip},
};
use hf_hub::{Repo, RepoType, api::sync::Api};
use image::RgbImage;
use std::{fmt, path::PathBuf, str::FromStr};
use tokenizers::Tokenizer;

const BASE_MODEL_ID: &str = "Salesforce/blip-image-captioning-base";
const BASE_REVISION: &str = "main";

// `model.safetensors` of the large checkpoint only lives on this revision
const LARGE_MODEL_ID: &str = "Salesforce/blip-image-captioning-large";
const LARGE_REVISION: &str = "refs/pr/18";

/// Maximum caption length, start token included.
pub const DEFAULT_MAX_LENGTH: usize = 100;

const QUANTIZED_MODEL_ID: &str = "lmz/candle-blip";
const QUANTIZED_WEIGHTS: &str = "blip-image-captioning-large-q4k.gguf";

// `[DEC]` starts the decoder, `[SEP]` ends the caption
const BOS_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;

#[derive(thiserror::Error, Debug)]
pub enum BlipError {
    #[error(transparent)]
    FailedToLoadModel(#[from] hf_hub::api::sync::ApiError),

    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    #[error(transparent)]
    TokenizerError(#[from] tokenizers::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("Max length must be at least 2, got {0}")]
    InvalidMaxLength(usize),

    #[error("Quantized weights are only published for the large model, not {0}")]
    QuantizedVariant(BlipVariant),
}

/// Size of the BLIP captioning checkpoint.
///
/// The variant fixes the network shape, so custom weights must come from a
/// checkpoint of the same size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlipVariant {
    /// ViT-B/16 encoder, ~250M parameters.
    #[default]
    Base,
    /// ViT-L/16 encoder, ~470M parameters.
    Large,
}

impl BlipVariant {
    /// Hub repository of the checkpoint and its tokenizer.
    pub fn model_id(&self) -> &'static str {
        match self {
            BlipVariant::Base => BASE_MODEL_ID,
            BlipVariant::Large => LARGE_MODEL_ID,
        }
    }

    /// Hub revision holding `model.safetensors`.
    pub fn revision(&self) -> &'static str {
        match self {
            BlipVariant::Base => BASE_REVISION,
            BlipVariant::Large => LARGE_REVISION,
        }
    }

    /// Network shape of the checkpoint.
    pub fn config(&self) -> blip::Config {
        let mut config = blip::Config::image_captioning_large();
        if *self == BlipVariant::Base {
            // base shares the text decoder, with a ViT-B vision tower
            config.vision_config.hidden_size = 768;
            config.vision_config.intermediate_size = 3072;
            config.vision_config.num_hidden_layers = 12;
            config.vision_config.num_attention_heads = 12;
            config.text_config.encoder_hidden_size = 768;
        }
        config
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlipVariant::Base => "base",
            BlipVariant::Large => "large",
        }
    }
}

impl fmt::Display for BlipVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlipVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" => Ok(BlipVariant::Base),
            "large" => Ok(BlipVariant::Large),
            _ => Err(format!("Unknown BLIP variant `{s}`, expected `base` or `large`")),
        }
    }
}

/// Configuration for the BLIP captioning model
#[derive(Clone, Debug)]
pub struct BlipConfig {
    /// Checkpoint size, fixes the network shape.
    pub variant: BlipVariant,
    /// Hub repository of the tokenizer and weights, defaults to the variant's.
    pub model_id: Option<String>,
    /// Revision of the weights, defaults to the variant's.
    pub revision: Option<String>,
    /// Use the q4k GGUF weights instead of the safetensors ones (large only).
    pub quantized: bool,
    /// Local weights file; skips the hub download when set.
    pub weights: Option<PathBuf>,
    /// Local `tokenizer.json`; skips the hub download when set.
    pub tokenizer: Option<PathBuf>,
    /// Run on the CPU even when a GPU is available.
    pub cpu: bool,
    /// Seed of the token sampler, only matters when sampling.
    pub seed: u64,
    /// Sampling temperature, greedy decoding when `None`.
    pub temperature: Option<f64>,
    /// Nucleus sampling cutoff, used together with `temperature`.
    pub top_p: Option<f64>,
}

impl BlipConfig {
    fn hub_model_id(&self) -> String {
        self.model_id
            .clone()
            .unwrap_or_else(|| self.variant.model_id().to_string())
    }

    fn hub_revision(&self) -> String {
        self.revision
            .clone()
            .unwrap_or_else(|| self.variant.revision().to_string())
    }
}

impl Default for BlipConfig {
    fn default() -> Self {
        Self {
            variant: BlipVariant::default(),
            model_id: None,
            revision: None,
            quantized: false,
            weights: None,
            tokenizer: None,
            cpu: false,
            seed: 1337,
            temperature: None,
            top_p: None,
        }
    }
}

enum Backbone {
    Full(blip::BlipForConditionalGeneration),
    Quantized(quantized_blip::BlipForConditionalGeneration),
}

impl Backbone {
    fn encode_image(&self, pixels: &Tensor) -> candle_core::Result<Tensor> {
        let pixels = pixels.unsqueeze(0)?;
        match self {
            Self::Full(m) => m.vision_model().forward(&pixels),
            Self::Quantized(m) => m.vision_model().forward(&pixels),
        }
    }

    fn decode(&mut self, input_ids: &Tensor, image_embeds: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Full(m) => m.text_decoder().forward(input_ids, image_embeds),
            Self::Quantized(m) => m.text_decoder().forward(input_ids, image_embeds),
        }
    }

    fn reset_kv_cache(&mut self) {
        match self {
            Self::Full(m) => m.reset_kv_cache(),
            Self::Quantized(m) => m.reset_kv_cache(),
        }
    }
}

/// The BLIP image captioning model
///
/// Wraps the Salesforce BLIP model (ViT encoder + BERT decoder) and generates a
/// caption for an rgb8 image.
///
/// NOTE: to run the model with Cuda, build with `--features cuda`. The
/// quantized weights always run on the CPU.
pub struct Blip {
    model: Backbone,
    tokenizer: Tokenizer,
    logits_processor: LogitsProcessor,
    device: Device,
}

impl Blip {
    /// Load the BLIP model, downloading the files from the hub when needed.
    pub fn new(config: BlipConfig) -> Result<Self, BlipError> {
        if config.quantized && config.variant != BlipVariant::Large {
            return Err(BlipError::QuantizedVariant(config.variant));
        }

        let device = if config.quantized {
            Device::Cpu
        } else {
            select_device(config.cpu)
        };

        let (weights, tokenizer) = Self::resolve_files(&config)?;
        log::debug!("Loading weights from {}", weights.display());

        let blip_config = config.variant.config();
        let model = if config.quantized {
            let vb = quantized_blip::VarBuilder::from_gguf(&weights, &device)?;
            Backbone::Quantized(quantized_blip::BlipForConditionalGeneration::new(
                &blip_config,
                vb,
            )?)
        } else {
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&weights], DType::F32, &device)? };
            Backbone::Full(blip::BlipForConditionalGeneration::new(&blip_config, vb)?)
        };

        let tokenizer = Tokenizer::from_file(tokenizer)?;
        let logits_processor = LogitsProcessor::new(config.seed, config.temperature, config.top_p);

        Ok(Self {
            model,
            tokenizer,
            logits_processor,
            device,
        })
    }

    /// The device the model runs on, `"cuda"` or `"cpu"`.
    pub fn device_name(&self) -> &'static str {
        if self.device.is_cuda() { "cuda" } else { "cpu" }
    }

    /// Generate a caption for an image
    ///
    /// # Arguments
    ///
    /// * `image` - The rgb8 image to caption, any size
    /// * `max_length` - Upper bound on the generated sequence, start token included
    ///
    /// # Returns
    ///
    /// The caption decoded without special tokens.
    pub fn caption(&mut self, image: &RgbImage, max_length: usize) -> Result<CaptionResponse, BlipError> {
        if max_length < 2 {
            return Err(BlipError::InvalidMaxLength(max_length));
        }

        // the decoder caches keys/values of the previous caption
        self.model.reset_kv_cache();

        let pixels = image_to_tensor(image, &self.device)?;
        let image_embeds = self.model.encode_image(&pixels)?;

        let mut token_ids = vec![BOS_TOKEN_ID];
        for index in 0..max_length - 1 {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;

            let logits = self.model.decode(&input_ids, &image_embeds)?.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;

            let token = self.logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }

        let caption = self.tokenizer.decode(&token_ids[1..], true)?;

        Ok(CaptionResponse {
            caption: caption.trim().to_string(),
            generated_tokens: token_ids.len() - 1,
        })
    }

    // utility function to locate the weights and the tokenizer
    fn resolve_files(config: &BlipConfig) -> Result<(PathBuf, PathBuf), BlipError> {
        if let (Some(weights), Some(tokenizer)) = (&config.weights, &config.tokenizer) {
            return Ok((weights.clone(), tokenizer.clone()));
        }

        let api = Api::new()?;

        let weights = match &config.weights {
            Some(path) => path.clone(),
            None if config.quantized => api.model(QUANTIZED_MODEL_ID.to_string()).get(QUANTIZED_WEIGHTS)?,
            None => api
                .repo(Repo::with_revision(
                    config.hub_model_id(),
                    RepoType::Model,
                    config.hub_revision(),
                ))
                .get("model.safetensors")?,
        };

        let tokenizer = match &config.tokenizer {
            Some(path) => path.clone(),
            None => api.model(config.hub_model_id()).get("tokenizer.json")?,
        };

        Ok((weights, tokenizer))
    }
}

impl InferenceModel for Blip {
    type Request = CaptionRequest;
    type Response = CaptionResponse;
    type Error = BlipError;

    fn run(&mut self, request: Self::Request) -> Result<Self::Response, Self::Error> {
        self.caption(&request.image, request.max_length)
    }
}

fn select_device(cpu: bool) -> Device {
    if cpu {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        match Device::cuda_if_available(0) {
            Ok(device) => return device,
            Err(e) => log::warn!("CUDA not available, defaulting to CPU: {e}"),
        }
    }

    Device::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_the_base_checkpoint() {
        let config = BlipConfig::default();
        assert_eq!(config.variant, BlipVariant::Base);
        assert_eq!(config.hub_model_id(), "Salesforce/blip-image-captioning-base");
        assert_eq!(config.hub_revision(), "main");
        assert!(!config.quantized);
        assert!(config.temperature.is_none());
    }

    #[test]
    fn explicit_model_id_and_revision_win() {
        let config = BlipConfig {
            variant: BlipVariant::Large,
            model_id: Some("me/my-blip".to_string()),
            revision: Some("v2".to_string()),
            ..BlipConfig::default()
        };
        assert_eq!(config.hub_model_id(), "me/my-blip");
        assert_eq!(config.hub_revision(), "v2");

        let config = BlipConfig {
            variant: BlipVariant::Large,
            ..BlipConfig::default()
        };
        assert_eq!(config.hub_model_id(), "Salesforce/blip-image-captioning-large");
        assert_eq!(config.hub_revision(), "refs/pr/18");
    }

    #[test]
    fn variant_shapes_match_the_checkpoints() {
        let large = BlipVariant::Large.config();
        assert_eq!(large.vision_config.hidden_size, 1024);
        assert_eq!(large.vision_config.num_hidden_layers, 24);
        assert_eq!(large.text_config.encoder_hidden_size, 1024);

        let base = BlipVariant::Base.config();
        assert_eq!(base.vision_config.hidden_size, 768);
        assert_eq!(base.vision_config.intermediate_size, 3072);
        assert_eq!(base.vision_config.num_hidden_layers, 12);
        assert_eq!(base.vision_config.num_attention_heads, 12);
        // the decoder cross-attends to the vision tower output
        assert_eq!(
            base.text_config.encoder_hidden_size,
            base.vision_config.hidden_size
        );
    }

    #[test]
    fn variant_parses_from_cli_values() {
        assert_eq!("base".parse::<BlipVariant>(), Ok(BlipVariant::Base));
        assert_eq!("large".parse::<BlipVariant>(), Ok(BlipVariant::Large));
        assert!("huge".parse::<BlipVariant>().is_err());
        assert_eq!(BlipVariant::Large.to_string(), "large");
    }

    #[test]
    fn quantized_base_is_rejected_before_loading() {
        let result = Blip::new(BlipConfig {
            variant: BlipVariant::Base,
            quantized: true,
            ..BlipConfig::default()
        });
        assert!(matches!(
            result,
            Err(BlipError::QuantizedVariant(BlipVariant::Base))
        ));
    }

    #[test]
    fn select_device_honours_cpu_flag() {
        assert!(select_device(true).is_cpu());
    }
}
