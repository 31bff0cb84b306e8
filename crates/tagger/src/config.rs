use std::env;
use std::str::FromStr;

pub const DEFAULT_THRESHOLD: f32 = 0.35;
pub const DEFAULT_INPUT_SIZE: u32 = 448;

/// How interrogation calls are serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationMode {
    /// One gate around engine invocation and aggregation for every model.
    #[default]
    Global,
    /// Each engine has its own lock; the gate only covers aggregation, so
    /// distinct models can infer in parallel.
    PerModel,
}

impl FromStr for SerializationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "per-model" | "per_model" | "permodel" => Ok(Self::PerModel),
            other => Err(format!(
                "{} is not a supported serialization mode. Use either `global` or `per-model`.",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionProvider {
    #[default]
    Cpu,
    Cuda,
}

impl FromStr for ExecutionProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(format!("{} is not a supported execution provider", other)),
        }
    }
}

/// Tag selection settings, see [`crate::filter::ThresholdPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub struct FilterConfig {
    pub threshold: f32,
    pub keep_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub additional_tags: Vec<String>,
    pub replace_tags: Vec<(String, String)>,
    pub tag_limit: Option<usize>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            keep_tags: Vec::new(),
            exclude_tags: Vec::new(),
            additional_tags: Vec::new(),
            replace_tags: Vec::new(),
            tag_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggerConfig {
    pub filter: FilterConfig,
    pub serialization: SerializationMode,
    pub input_size: u32,
    pub execution_provider: ExecutionProvider,
}

impl TaggerConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let threshold = parse_var("TAGGER_THRESHOLD")?.unwrap_or(DEFAULT_THRESHOLD);
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!("TAGGER_THRESHOLD must be within 0.0..=1.0, got {}", threshold);
        }

        let replace_tags = env::var("TAGGER_REPLACE_TAGS")
            .map(|value| parse_replacements(&value))
            .unwrap_or_else(|_| Ok(Vec::new()))?;

        let filter = FilterConfig {
            threshold,
            keep_tags: list_var("TAGGER_KEEP_TAGS"),
            exclude_tags: list_var("TAGGER_EXCLUDE_TAGS"),
            additional_tags: list_var("TAGGER_ADDITIONAL_TAGS"),
            replace_tags,
            tag_limit: parse_var("TAGGER_TAG_LIMIT")?,
        };

        let serialization = parse_var("TAGGER_SERIALIZATION")?.unwrap_or_default();
        let input_size = parse_var("TAGGER_INPUT_SIZE")?.unwrap_or(DEFAULT_INPUT_SIZE);
        let execution_provider = parse_var("TAGGER_EXECUTION_PROVIDER")?.unwrap_or_default();

        Ok(Self {
            filter,
            serialization,
            input_size,
            execution_provider,
        })
    }
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            filter: FilterConfig::default(),
            serialization: SerializationMode::Global,
            input_size: DEFAULT_INPUT_SIZE,
            execution_provider: ExecutionProvider::Cpu,
        }
    }
}

fn parse_var<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        _ => Ok(None),
    }
}

fn list_var(name: &str) -> Vec<String> {
    env::var(name)
        .map(|value| split_list(&value))
        .unwrap_or_default()
}

/// Split a comma-separated list, dropping empty entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `search=replace` pairs separated by commas.
pub fn parse_replacements(value: &str) -> anyhow::Result<Vec<(String, String)>> {
    split_list(value)
        .into_iter()
        .map(|entry| {
            let (search, replace) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("Replacement `{}` is missing `=`", entry))?;
            let (search, replace) = (search.trim(), replace.trim());
            if search.is_empty() || replace.is_empty() {
                anyhow::bail!("Replacement `{}` has an empty side", entry);
            }
            Ok((search.to_string(), replace.to_string()))
        })
        .collect()
}
