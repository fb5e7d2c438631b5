use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// BLIP base checkpoint, the model the service was originally built around.
const DEFAULT_MODEL_REPO: &str = "Salesforce/blip-image-captioning-base";

/// Maximum caption length in tokens, the BOS prompt token included.
const DEFAULT_MAX_TOKENS: usize = 100;

const DEFAULT_SEED: u64 = 1337;

/// 10 MiB.
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const DEFAULT_ALLOWED_MIME_TYPES: &str = "image/jpeg,image/png,image/gif,image/bmp,image/webp";

#[derive(Debug, Clone)]
pub struct CaptionConfig {
    pub common: core_config::Config,
    pub model: ModelConfig,
    pub upload: UploadConfig,
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub backend: ModelBackend,
    pub variant: BlipVariant,
    /// Hub repository holding the weights.
    pub repo: String,
    pub revision: String,
    /// File inside `repo`; a `.gguf` extension selects the quantized model.
    pub weights_file: String,
    pub tokenizer_repo: String,
    /// Local weights, bypassing the hub.
    pub weights_path: Option<PathBuf>,
    /// Local `tokenizer.json`, bypassing the hub.
    pub tokenizer_path: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub max_tokens: usize,
    pub seed: u64,
    pub force_cpu: bool,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_bytes: usize,
    pub allowed_mime_types: Vec<String>,
    /// When false, MIME type and size are not checked before decoding.
    pub validate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelBackend {
    Blip,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlipVariant {
    Base,
    Large,
}

impl CaptionConfig {
    pub fn load() -> Result<Self, AppError> {
        // Load common config (handles .env and APP__ prefix)
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let repo = get_env("CAPTION_MODEL_REPO", Some(DEFAULT_MODEL_REPO), is_prod)?;

        Ok(CaptionConfig {
            common: common_config,
            model: ModelConfig {
                backend: parse_env("CAPTION_BACKEND", "blip", is_prod)?,
                variant: parse_env("CAPTION_MODEL_VARIANT", "base", is_prod)?,
                revision: get_env("CAPTION_MODEL_REVISION", Some("main"), is_prod)?,
                weights_file: get_env("CAPTION_WEIGHTS_FILE", Some("model.safetensors"), is_prod)?,
                tokenizer_repo: get_env("CAPTION_TOKENIZER_REPO", Some(&repo), is_prod)?,
                weights_path: env::var("CAPTION_WEIGHTS_PATH").ok().map(PathBuf::from),
                tokenizer_path: env::var("CAPTION_TOKENIZER_PATH").ok().map(PathBuf::from),
                cache_dir: env::var("CAPTION_HF_CACHE_DIR").ok().map(PathBuf::from),
                max_tokens: parse_env(
                    "CAPTION_MAX_TOKENS",
                    &DEFAULT_MAX_TOKENS.to_string(),
                    is_prod,
                )?,
                seed: parse_env("CAPTION_SEED", &DEFAULT_SEED.to_string(), is_prod)?,
                force_cpu: parse_env("CAPTION_FORCE_CPU", "false", is_prod)?,
                repo,
            },
            upload: UploadConfig {
                max_bytes: parse_env(
                    "UPLOAD_MAX_BYTES",
                    &DEFAULT_MAX_UPLOAD_BYTES.to_string(),
                    is_prod,
                )?,
                allowed_mime_types: parse_mime_list(&get_env(
                    "UPLOAD_ALLOWED_MIME_TYPES",
                    Some(DEFAULT_ALLOWED_MIME_TYPES),
                    is_prod,
                )?),
                validate: parse_env("UPLOAD_VALIDATE", "true", is_prod)?,
            },
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
        })
    }
}

impl ModelConfig {
    pub fn is_quantized(&self) -> bool {
        self.weights_path
            .as_deref()
            .unwrap_or_else(|| Path::new(&self.weights_file))
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"))
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_mime_types: parse_mime_list(DEFAULT_ALLOWED_MIME_TYPES),
            validate: true,
        }
    }
}

impl FromStr for ModelBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "blip" => Ok(ModelBackend::Blip),
            "mock" => Ok(ModelBackend::Mock),
            _ => Err(format!("Invalid caption backend: {}", s)),
        }
    }
}

impl FromStr for BlipVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "base" => Ok(BlipVariant::Base),
            "large" => Ok(BlipVariant::Large),
            _ => Err(format!("Invalid BLIP variant: {}", s)),
        }
    }
}

fn parse_mime_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get_env(key, Some(default), is_prod)?;
    raw.trim().parse().map_err(|e: T::Err| {
        AppError::ConfigError(anyhow::anyhow!("Invalid value for {}: {}", key, e))
    })
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_config(weights_file: &str) -> ModelConfig {
        ModelConfig {
            backend: ModelBackend::Blip,
            variant: BlipVariant::Base,
            repo: DEFAULT_MODEL_REPO.to_string(),
            revision: "main".to_string(),
            weights_file: weights_file.to_string(),
            tokenizer_repo: DEFAULT_MODEL_REPO.to_string(),
            weights_path: None,
            tokenizer_path: None,
            cache_dir: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            seed: DEFAULT_SEED,
            force_cpu: true,
        }
    }

    #[test]
    fn backend_parses_case_insensitively() {
        assert_eq!("MOCK".parse::<ModelBackend>().unwrap(), ModelBackend::Mock);
        assert_eq!("blip".parse::<ModelBackend>().unwrap(), ModelBackend::Blip);
        assert!("onnx".parse::<ModelBackend>().is_err());
    }

    #[test]
    fn variant_parses() {
        assert_eq!("Large".parse::<BlipVariant>().unwrap(), BlipVariant::Large);
        assert!("huge".parse::<BlipVariant>().is_err());
    }

    #[test]
    fn mime_list_is_trimmed_and_lowercased() {
        assert_eq!(
            parse_mime_list(" image/PNG , image/jpeg,,"),
            vec!["image/png".to_string(), "image/jpeg".to_string()]
        );
    }

    #[test]
    fn gguf_weights_select_quantized_model() {
        assert!(!model_config("model.safetensors").is_quantized());
        assert!(model_config("blip-image-captioning-large-q4k.gguf").is_quantized());

        let mut local = model_config("model.safetensors");
        local.weights_path = Some(PathBuf::from("/models/blip.GGUF"));
        assert!(local.is_quantized());
    }

    #[test]
    fn default_upload_config_accepts_common_image_types() {
        let upload = UploadConfig::default();
        assert_eq!(upload.max_bytes, 10 * 1024 * 1024);
        assert!(upload.validate);
        assert!(upload.allowed_mime_types.contains(&"image/jpeg".to_string()));
        assert!(upload.allowed_mime_types.contains(&"image/png".to_string()));
    }

    // Keys below are unique to this module so parallel tests never share them.

    #[test]
    fn unset_variable_takes_default_outside_prod() {
        let value = get_env("CAPTION_TEST_UNSET_DEV", Some("fallback"), false).unwrap();
        assert_eq!(value, "fallback");
    }

    #[test]
    fn unset_variable_is_an_error_in_prod() {
        let err = get_env("CAPTION_TEST_UNSET_PROD", Some("fallback"), true).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert!(err.to_string().contains("CAPTION_TEST_UNSET_PROD"));
    }

    #[test]
    fn unset_variable_without_default_is_an_error() {
        let err = get_env("CAPTION_TEST_UNSET_REQUIRED", None, false).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn non_numeric_value_is_a_config_error() {
        env::set_var("CAPTION_TEST_BAD_NUMBER", "ten megabytes");
        let err = parse_env::<usize>("CAPTION_TEST_BAD_NUMBER", "1", false).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert!(err.to_string().contains("CAPTION_TEST_BAD_NUMBER"));
    }

    #[test]
    fn unknown_backend_is_a_config_error() {
        env::set_var("CAPTION_TEST_BAD_BACKEND", "onnx");
        let err =
            parse_env::<ModelBackend>("CAPTION_TEST_BAD_BACKEND", "blip", false).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn set_value_is_trimmed_and_parsed() {
        env::set_var("CAPTION_TEST_GOOD_NUMBER", " 42 ");
        let value = parse_env::<usize>("CAPTION_TEST_GOOD_NUMBER", "1", true).unwrap();
        assert_eq!(value, 42);
    }
}
