use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScannerConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub record_git_revision: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            root: None,
            extensions: default_extensions(),
            exclude_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            follow_symlinks: false,
            record_git_revision: false,
        }
    }
}

fn default_extensions() -> Vec<String> {
    ["md", "markdown", "txt", "rs", "py", "js", "ts"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_file_bytes() -> u64 {
    2 * 1024 * 1024
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            min_tokens: default_min_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}
fn default_min_tokens() -> usize {
    40
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

/// Which inference backend a query prefers.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderPreference {
    #[default]
    Local,
    Cloud,
    Auto,
}

impl ProviderPreference {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "cloud" => Some(Self::Cloud),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InferenceConfig {
    #[serde(default)]
    pub preference: ProviderPreference,
    /// Send advisory queries to the remote backend under `auto`.
    #[serde(default)]
    pub remote_for_advisory: bool,
    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub local: Option<BackendConfig>,
    #[serde(default)]
    pub remote: Option<BackendConfig>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            preference: ProviderPreference::Local,
            remote_for_advisory: false,
            timeout_secs: default_inference_timeout(),
            local: None,
            remote: None,
        }
    }
}

fn default_inference_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackendConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_agent_max_rounds")]
    pub agent_max_rounds: usize,
    #[serde(default = "default_temporal_days")]
    pub temporal_default_days: u32,
    #[serde(default = "default_temporal_max_documents")]
    pub temporal_max_documents: usize,
    #[serde(default = "default_temporal_chunks_per_document")]
    pub temporal_chunks_per_document: usize,
    #[serde(default = "default_prompt_budget")]
    pub prompt_budget_chars: usize,
    #[serde(default = "default_reduce_fan_in")]
    pub reduce_fan_in: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            agent_max_rounds: default_agent_max_rounds(),
            temporal_default_days: default_temporal_days(),
            temporal_max_documents: default_temporal_max_documents(),
            temporal_chunks_per_document: default_temporal_chunks_per_document(),
            prompt_budget_chars: default_prompt_budget(),
            reduce_fan_in: default_reduce_fan_in(),
        }
    }
}

fn default_k() -> usize {
    8
}
fn default_agent_max_rounds() -> usize {
    3
}
fn default_temporal_days() -> u32 {
    7
}
fn default_temporal_max_documents() -> usize {
    20
}
fn default_temporal_chunks_per_document() -> usize {
    3
}
fn default_prompt_budget() -> usize {
    12_000
}
fn default_reduce_fan_in() -> usize {
    6
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    4
}

impl Config {
    /// A config with every default, storing its files under `data_dir`.
    pub fn minimal_in(data_dir: &Path) -> Self {
        Self {
            db: DbConfig {
                path: data_dir.join("semsearch.sqlite"),
            },
            index: IndexConfig {
                path: data_dir.join("semsearch.index"),
            },
            scanner: ScannerConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            inference: InferenceConfig::default(),
            retrieval: RetrievalConfig::default(),
            indexing: IndexingConfig::default(),
        }
    }

    /// Defaults rooted at `./data`.
    pub fn minimal() -> Self {
        Self::minimal_in(Path::new("./data"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
        }
        if self.retrieval.k == 0 {
            bail!("retrieval.k must be >= 1");
        }
        if self.retrieval.agent_max_rounds == 0 {
            bail!("retrieval.agent_max_rounds must be >= 1");
        }
        if self.retrieval.reduce_fan_in < 2 {
            bail!("retrieval.reduce_fan_in must be >= 2");
        }
        if self.indexing.workers == 0 {
            bail!("indexing.workers must be >= 1");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be >= 1");
        }
        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }

        match self.embedding.provider.as_str() {
            "hash" | "ollama" | "openai" | "local" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, ollama, openai, or local.",
                other
            ),
        }
        if matches!(self.embedding.provider.as_str(), "ollama" | "openai")
            && self.embedding.model.is_none()
        {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                self.embedding.provider
            );
        }

        for (name, backend) in [
            ("inference.local", &self.inference.local),
            ("inference.remote", &self.inference.remote),
        ] {
            if let Some(b) = backend {
                match b.provider.as_str() {
                    "ollama" | "openai" => {}
                    other => bail!(
                        "Unknown {} provider: '{}'. Must be ollama or openai.",
                        name,
                        other
                    ),
                }
            }
        }
        if self.inference.preference == ProviderPreference::Cloud
            && self.inference.remote.is_none()
        {
            bail!("inference.preference = \"cloud\" requires an [inference.remote] table");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
[db]
path = "/tmp/semsearch/meta.sqlite"

[index]
path = "/tmp/semsearch/vectors.index"

[scanner]
root = "/home/me/journal"
extensions = ["md"]

[inference]
preference = "auto"
remote_for_advisory = true

[inference.local]
provider = "ollama"
model = "llama3"

[inference.remote]
provider = "openai"
model = "gpt-4o-mini"
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config: Config = toml::from_str(BASIC).unwrap();
        config.validate().unwrap();
        assert_eq!(config.chunking.max_tokens, 700);
        assert_eq!(config.retrieval.agent_max_rounds, 3);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.inference.preference, ProviderPreference::Auto);
        assert_eq!(config.scanner.extensions, vec!["md".to_string()]);
    }

    #[test]
    fn test_rejects_overlap_larger_than_chunk() {
        let mut config = Config::minimal();
        config.chunking.overlap_tokens = config.chunking.max_tokens;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cloud_requires_remote() {
        let mut config = Config::minimal();
        config.inference.preference = ProviderPreference::Cloud;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("inference.remote"));
    }

    #[test]
    fn test_unknown_embedding_provider() {
        let mut config = Config::minimal();
        config.embedding.provider = "word2vec".into();
        assert!(config.validate().is_err());
    }
}
