//! Model catalog for routing decisions
//!
//! A [`ModelConfig`] describes one routable model: owning provider family,
//! per-1K token costs, nominal latency, a quality score, and capability
//! flags. The default catalog mixes zero-cost local models with hosted
//! entries so cost-optimized routing has a meaningful gradient; callers
//! extend it at construction or through `MultiModelRouter::add_model`.

use serde::{Deserialize, Serialize};

use crate::provider::ProviderKind;

/// Capability flags a request can demand from a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Code,
    Reasoning,
    Vision,
    FunctionCalling,
    Streaming,
    LongContext,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Chat => write!(f, "chat"),
            Capability::Code => write!(f, "code"),
            Capability::Reasoning => write!(f, "reasoning"),
            Capability::Vision => write!(f, "vision"),
            Capability::FunctionCalling => write!(f, "function_calling"),
            Capability::Streaming => write!(f, "streaming"),
            Capability::LongContext => write!(f, "long_context"),
        }
    }
}

/// One routable model in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Catalog key, unique across the catalog
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Provider family serving the model
    pub provider: ProviderKind,
    /// Dollars per 1K prompt tokens
    pub input_cost_per_1k: f64,
    /// Dollars per 1K generated tokens
    pub output_cost_per_1k: f64,
    /// Typical round-trip latency
    pub nominal_latency_ms: u64,
    /// Output quality in [0, 1]
    pub quality: f64,
    /// What the model can do
    pub capabilities: Vec<Capability>,
    /// Prompt context window in tokens
    pub context_length: u32,
    /// Output ceiling in tokens
    pub max_output_tokens: u32,
    /// Whether the model runs locally, without per-token spend
    pub local: bool,
}

impl ModelConfig {
    /// Create a catalog entry with zero cost and middling quality
    pub fn new(id: impl Into<String>, name: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider,
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
            nominal_latency_ms: 500,
            quality: 0.5,
            capabilities: vec![Capability::Chat],
            context_length: 8_192,
            max_output_tokens: 4_096,
            local: false,
        }
    }

    /// Set per-1K input/output costs
    pub fn with_costs(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.input_cost_per_1k = input_per_1k;
        self.output_cost_per_1k = output_per_1k;
        self
    }

    /// Set the nominal latency
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.nominal_latency_ms = latency_ms;
        self
    }

    /// Set the quality score
    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality;
        self
    }

    /// Replace the capability flags
    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the context window
    pub fn with_context_length(mut self, tokens: u32) -> Self {
        self.context_length = tokens;
        self
    }

    /// Set the output ceiling
    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    /// Mark the model as locally served
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Average of input and output per-1K cost, used by cost scoring
    pub fn blended_cost_per_1k(&self) -> f64 {
        (self.input_cost_per_1k + self.output_cost_per_1k) / 2.0
    }

    /// Whether the model advertises every required capability
    pub fn has_capabilities(&self, required: &[Capability]) -> bool {
        required.iter().all(|req| self.capabilities.contains(req))
    }

    /// Check the entry for internal consistency
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("model id must not be empty".to_string());
        }
        if !(0.0..=1.0).contains(&self.quality) {
            return Err(format!(
                "quality must be in [0, 1], got {} for {}",
                self.quality, self.id
            ));
        }
        if self.input_cost_per_1k < 0.0 || self.output_cost_per_1k < 0.0 {
            return Err(format!("costs must be non-negative for {}", self.id));
        }
        Ok(())
    }
}

/// The catalog a router starts from when none is supplied
///
/// Ordering matters: stable sorting breaks score ties by catalog position,
/// so the zero-cost local entries lead.
pub fn default_catalog() -> Vec<ModelConfig> {
    use Capability::*;
    vec![
        ModelConfig::new("phi-4-mini", "Phi-4 Mini", ProviderKind::Local)
            .local()
            .with_latency_ms(150)
            .with_quality(0.62)
            .with_capabilities(vec![Chat, Code])
            .with_context_length(16_000),
        ModelConfig::new("llama-3.3-70b", "Llama 3.3 70B", ProviderKind::Local)
            .local()
            .with_latency_ms(450)
            .with_quality(0.78)
            .with_capabilities(vec![Chat, Code, Reasoning, FunctionCalling, LongContext])
            .with_context_length(128_000),
        ModelConfig::new(
            "claude-3-haiku-20240307",
            "Claude 3 Haiku",
            ProviderKind::Anthropic,
        )
        .with_costs(0.00025, 0.00125)
        .with_latency_ms(800)
        .with_quality(0.74)
        .with_capabilities(vec![Chat, Code, Vision, Streaming, LongContext])
        .with_context_length(200_000),
        ModelConfig::new(
            "claude-3-opus-20240229",
            "Claude 3 Opus",
            ProviderKind::Anthropic,
        )
        .with_costs(0.015, 0.075)
        .with_latency_ms(2_500)
        .with_quality(0.95)
        .with_capabilities(vec![Chat, Code, Reasoning, Vision, Streaming, LongContext])
        .with_context_length(200_000),
        ModelConfig::new("gpt-4o", "GPT-4o", ProviderKind::OpenAi)
            .with_costs(0.0025, 0.01)
            .with_latency_ms(1_200)
            .with_quality(0.90)
            .with_capabilities(vec![
                Chat,
                Code,
                Reasoning,
                Vision,
                FunctionCalling,
                Streaming,
                LongContext,
            ])
            .with_context_length(128_000)
            .with_max_output_tokens(16_384),
        ModelConfig::new("gpt-4o-mini", "GPT-4o Mini", ProviderKind::OpenAi)
            .with_costs(0.00015, 0.0006)
            .with_latency_ms(600)
            .with_quality(0.72)
            .with_capabilities(vec![Chat, Code, Vision, FunctionCalling, Streaming, LongContext])
            .with_context_length(128_000)
            .with_max_output_tokens(16_384),
        ModelConfig::new("gemini-2.0-flash", "Gemini 2.0 Flash", ProviderKind::Google)
            .with_costs(0.0001, 0.0004)
            .with_latency_ms(700)
            .with_quality(0.76)
            .with_capabilities(vec![Chat, Code, Vision, FunctionCalling, Streaming, LongContext])
            .with_context_length(1_048_576)
            .with_max_output_tokens(8_192),
    ]
}
