use anyhow::{anyhow, bail};
use candle_core::{DType, Device};
use hf_hub::api::sync::{Api, ApiRepo};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumString};
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";
const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";
const SAFETENSORS_FILE: &str = "model.safetensors";

/// How the checkpoint at `model_path` relates to `model_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LoadMode {
    /// `model_path` holds a complete fine-tuned model.
    #[default]
    Finetuned,
    /// `model_base` holds the language model and the projector comes from a separate file.
    Pretrained,
}

#[derive(Debug, Clone)]
pub struct LLaVALoadOptions {
    pub model_base: String,
    pub model_path: String,
    /// Only read in [`LoadMode::Pretrained`].
    pub projector_path: Option<PathBuf>,
    pub mode: LoadMode,
    pub device: Device,
    /// Overrides `torch_dtype` from the model config.
    pub dtype: Option<DType>,
}

/// A model directory on disk, or a repository on the Hugging Face hub.
pub enum ModelRepo {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl ModelRepo {
    pub fn open(id: &str) -> anyhow::Result<Self> {
        let path = Path::new(id);
        if path.is_dir() {
            debug!("using local model directory {}", path.display());
            return Ok(Self::Local(path.to_path_buf()));
        }
        info!("{} is not a local directory, resolving it on the hub", id);
        let api = Api::new()?;
        Ok(Self::Hub(api.model(id.to_string())))
    }

    pub fn get(&self, file_name: &str) -> anyhow::Result<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(file_name);
                if path.is_file() {
                    Ok(path)
                } else {
                    bail!("{} not found in {}", file_name, dir.display())
                }
            }
            Self::Hub(repo) => Ok(repo.get(file_name)?),
        }
    }

    pub fn get_optional(&self, file_name: &str) -> Option<PathBuf> {
        self.get(file_name).ok()
    }

    /// Safetensors shards in load order.
    pub fn safetensors(&self) -> anyhow::Result<Vec<PathBuf>> {
        if let Some(index) = self.get_optional(SAFETENSORS_INDEX_FILE) {
            return self.sharded_safetensors(&index);
        }
        match self {
            Self::Local(dir) => {
                let mut weights = std::fs::read_dir(dir)?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
                    .collect::<Vec<_>>();
                if weights.is_empty() {
                    bail!("no safetensors weights in {}", dir.display());
                }
                weights.sort_by_key(|path| natural_sort_key(&path.to_string_lossy()));
                Ok(weights)
            }
            Self::Hub(repo) => Ok(vec![repo.get(SAFETENSORS_FILE)?]),
        }
    }

    fn sharded_safetensors(&self, index: &Path) -> anyhow::Result<Vec<PathBuf>> {
        #[derive(Deserialize)]
        struct SafetensorsIndex {
            weight_map: HashMap<String, String>,
        }

        let index: SafetensorsIndex = serde_json::from_slice(&std::fs::read(index)?)?;
        let mut shards = index
            .weight_map
            .into_values()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        shards.sort_by_key(|name| natural_sort_key(name));
        shards.iter().map(|name| self.get(name)).collect()
    }
}

/// Resolves a projector given either as a weights file or as a directory of them.
pub fn projector_weights(projector_path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if projector_path.is_dir() {
        ModelRepo::Local(projector_path.to_path_buf()).safetensors()
    } else if projector_path.is_file() {
        Ok(vec![projector_path.to_path_buf()])
    } else {
        bail!("projector not found at {}", projector_path.display())
    }
}

/// Every file needed to build a LLaVA model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub preprocessor_config: Option<PathBuf>,
    pub generation_config: Option<PathBuf>,
    /// Later files win when several define the same tensor.
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    pub fn resolve(options: &LLaVALoadOptions) -> anyhow::Result<Self> {
        let model = ModelRepo::open(&options.model_path)?;

        let weights = match options.mode {
            LoadMode::Finetuned => model.safetensors()?,
            LoadMode::Pretrained => {
                let projector_path = options
                    .projector_path
                    .as_ref()
                    .ok_or_else(|| anyhow!("pretrained mode requires a projector path"))?;
                let base = ModelRepo::open(&options.model_base)?;
                let mut weights = base.safetensors()?;
                // vision tower weights may live next to the llava config
                if let Ok(extra) = model.safetensors() {
                    weights.extend(extra);
                }
                weights.extend(projector_weights(projector_path)?);
                weights
            }
        };

        // tokenizer and configs are looked up in model_path first, then model_base
        let base = match options.mode {
            LoadMode::Pretrained => Some(ModelRepo::open(&options.model_base)?),
            LoadMode::Finetuned if options.model_base != options.model_path => {
                ModelRepo::open(&options.model_base).ok()
            }
            LoadMode::Finetuned => None,
        };
        let lookup = |file_name: &str| {
            model
                .get_optional(file_name)
                .or_else(|| base.as_ref().and_then(|base| base.get_optional(file_name)))
        };

        let config = lookup(CONFIG_FILE)
            .ok_or_else(|| anyhow!("{} not found for {}", CONFIG_FILE, options.model_path))?;
        let tokenizer = lookup(TOKENIZER_FILE)
            .ok_or_else(|| anyhow!("{} not found for {}", TOKENIZER_FILE, options.model_path))?;

        Ok(Self {
            config,
            tokenizer,
            preprocessor_config: lookup(PREPROCESSOR_CONFIG_FILE),
            generation_config: lookup(GENERATION_CONFIG_FILE),
            weights,
        })
    }
}

/// Splits a file name into text and numeric runs so that "model-2-of-10" sorts
/// before "model-10-of-10".
fn natural_sort_key(s: &str) -> Vec<Result<u64, String>> {
    let basename = Path::new(s)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(s);
    let mut parts = Vec::new();
    let mut chars = basename.chars().peekable();
    while let Some(c) = chars.peek().copied() {
        let is_digit = c.is_ascii_digit();
        let mut run = String::new();
        while let Some(c) = chars.peek().copied() {
            if c.is_ascii_digit() != is_digit {
                break;
            }
            run.push(c);
            chars.next();
        }
        if is_digit {
            parts.push(run.parse::<u64>().map_err(|_| run.clone()));
        } else {
            parts.push(Err(run));
        }
    }
    parts
}
