//! Specialized worker: domain profiles and task-match scoring
//!
//! A [`SpecializedWorker`] wraps the base worker with a
//! [`SpecializationProfile`] (primary/secondary domains plus per-skill
//! proficiency) and can score how well a task fits it before anyone commits
//! to routing. Optional [`DomainProcessor`] hooks let hosts rewrite task
//! payloads on the way in and annotate outputs on the way out.
//!
//! Required capabilities are inferred from two static tables: a task-type
//! lookup and a description keyword scan. The pool router reuses
//! [`infer_required_capabilities`] for its own capability scoring.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embedding::{capability_embedding, cosine_similarity, task_embedding};
use crate::events::SharedEventBus;
use crate::task::{Task, TaskOutput};

use super::base::WorkerBase;
use super::{
    CancelSignal, ExecutionContext, SharedTaskExecutor, SimulatedExecutor, Worker, WorkerConfig,
    WorkerHealth, WorkerMessage, WorkerMetrics, WorkerResult, WorkerStatus,
};

/// Weight of the capability overlap sub-score
const WEIGHT_CAPABILITY: f64 = 0.35;
/// Weight of the domain alignment sub-score
const WEIGHT_DOMAIN: f64 = 0.25;
/// Weight of the skill proficiency sub-score
const WEIGHT_SKILL: f64 = 0.2;
/// Weight of the embedding similarity sub-score
const WEIGHT_EMBEDDING: f64 = 0.2;

/// Match score below which recommendations are attached
const LOW_MATCH_THRESHOLD: f64 = 0.5;

/// Capabilities implied by a task type tag
static TYPE_CAPABILITIES: LazyLock<HashMap<&'static str, &'static [&'static str]>> =
    LazyLock::new(|| {
        let mut table: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
        table.insert("code-generation", &["code-generation"]);
        table.insert("code-review", &["code-review", "static-analysis"]);
        table.insert("testing", &["testing", "test-generation"]);
        table.insert("documentation", &["documentation", "technical-writing"]);
        table.insert("refactoring", &["refactoring", "code-analysis"]);
        table.insert("debugging", &["debugging", "error-analysis"]);
        table.insert("architecture", &["architecture", "system-design"]);
        table.insert("data-analysis", &["data-analysis"]);
        table.insert("deployment", &["deployment", "devops"]);
        table
    });

/// Capabilities implied by keywords in a task description
static KEYWORD_CAPABILITIES: LazyLock<Vec<(&'static str, &'static str)>> = LazyLock::new(|| {
    vec![
        ("typescript", "typescript"),
        ("rust", "rust"),
        ("python", "python"),
        ("javascript", "javascript"),
        ("test", "testing"),
        ("review", "code-review"),
        ("document", "documentation"),
        ("refactor", "refactoring"),
        ("debug", "debugging"),
        ("deploy", "deployment"),
        ("api", "api-design"),
        ("database", "database"),
        ("security", "security-analysis"),
        ("performance", "performance-tuning"),
    ]
});

/// Derive the capabilities a task requires from its type tag and description
///
/// The type table contributes first, then keyword hits in the lowercased
/// description, deduplicated in encounter order.
pub fn infer_required_capabilities(task: &Task) -> Vec<String> {
    let mut required: Vec<String> = Vec::new();

    if let Some(caps) = TYPE_CAPABILITIES.get(task.task_type.as_str()) {
        for cap in caps.iter() {
            required.push((*cap).to_string());
        }
    }

    let description = task.description.to_lowercase();
    for (keyword, cap) in KEYWORD_CAPABILITIES.iter() {
        if description.contains(keyword) && !required.iter().any(|c| c == cap) {
            required.push((*cap).to_string());
        }
    }

    required
}

/// Domain profile carried by a specialized worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecializationProfile {
    /// Primary domain this worker is built for
    pub primary_domain: String,
    /// Domains the worker handles competently but not primarily
    pub secondary_domains: Vec<String>,
    /// Proficiency per skill name, each in [0, 1]
    pub skills: HashMap<String, f64>,
}

impl SpecializationProfile {
    /// Create a profile for a primary domain
    pub fn new(primary_domain: impl Into<String>) -> Self {
        Self {
            primary_domain: primary_domain.into(),
            secondary_domains: Vec::new(),
            skills: HashMap::new(),
        }
    }

    /// Add a secondary domain
    pub fn with_secondary_domain(mut self, domain: impl Into<String>) -> Self {
        self.secondary_domains.push(domain.into());
        self
    }

    /// Record a skill proficiency
    pub fn with_skill(mut self, skill: impl Into<String>, proficiency: f64) -> Self {
        self.skills.insert(skill.into(), proficiency.clamp(0.0, 1.0));
        self
    }

    fn is_primary(&self, domain: &str) -> bool {
        self.primary_domain.eq_ignore_ascii_case(domain)
    }

    fn is_secondary(&self, domain: &str) -> bool {
        self.secondary_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
    }
}

/// Result of scoring a task against a specialized worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMatch {
    /// Weighted composite score in [0, 1]
    pub score: f64,
    /// Whether the worker covers every required capability
    pub meets_minimum: bool,
    /// Fraction of required capabilities the worker declares
    pub capability_score: f64,
    /// Domain alignment sub-score
    pub domain_score: f64,
    /// Average proficiency over the skills the task touches
    pub skill_score: f64,
    /// Embedding similarity sub-score (clamped at zero)
    pub embedding_score: f64,
    /// Required capabilities the worker declares
    pub matched_capabilities: Vec<String>,
    /// Required capabilities the worker lacks
    pub missing_capabilities: Vec<String>,
    /// Guidance attached when the composite score is low
    pub recommendations: Vec<String>,
}

/// Hooks around task execution for domain-specific rewriting
///
/// Both hooks default to pass-through; a worker without a processor behaves
/// identically to one with the default hooks.
#[async_trait]
pub trait DomainProcessor: Send + Sync {
    /// Rewrite or enrich a task before execution
    async fn preprocess(&self, task: Task) -> WorkerResult<Task> {
        Ok(task)
    }

    /// Annotate or transform the output after execution
    async fn postprocess(&self, output: TaskOutput) -> WorkerResult<TaskOutput> {
        Ok(output)
    }
}

/// Worker with a domain profile, match scoring, and processing hooks
pub struct SpecializedWorker {
    base: WorkerBase,
    profile: SpecializationProfile,
    processor: Option<Arc<dyn DomainProcessor>>,
}

impl SpecializedWorker {
    /// Create a specialized worker
    ///
    /// When the config carries no explicit specialization embedding, one is
    /// derived from the capability set plus the profile's domains and skill
    /// names, so profile-only workers still land near related tasks in
    /// embedding space.
    pub fn new(
        mut config: WorkerConfig,
        profile: SpecializationProfile,
        executor: SharedTaskExecutor,
        events: SharedEventBus,
    ) -> WorkerResult<Self> {
        if config.specialization.is_none() {
            let mut terms = config.capabilities.clone();
            terms.push(profile.primary_domain.clone());
            terms.extend(profile.secondary_domains.iter().cloned());
            terms.extend(profile.skills.keys().cloned());
            config.specialization = Some(capability_embedding(&terms));
        }

        Ok(Self {
            base: WorkerBase::new(config, executor, events)?,
            profile,
            processor: None,
        })
    }

    /// Create a specialized worker backed by the simulated executor
    pub fn with_simulated_executor(
        config: WorkerConfig,
        profile: SpecializationProfile,
        events: SharedEventBus,
    ) -> WorkerResult<Self> {
        Self::new(config, profile, Arc::new(SimulatedExecutor::default()), events)
    }

    /// Attach domain processing hooks
    pub fn with_processor(mut self, processor: Arc<dyn DomainProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// The worker's domain profile
    pub fn profile(&self) -> &SpecializationProfile {
        &self.profile
    }

    /// Score how well a task fits this worker
    pub fn match_task(&self, task: &Task) -> TaskMatch {
        let required = infer_required_capabilities(task);

        let mut matched = Vec::new();
        let mut missing = Vec::new();
        for cap in &required {
            let declared = self
                .base
                .config()
                .capabilities
                .iter()
                .any(|c| c.eq_ignore_ascii_case(cap));
            if declared {
                matched.push(cap.clone());
            } else {
                missing.push(cap.clone());
            }
        }
        let capability_score = if required.is_empty() {
            1.0
        } else {
            matched.len() as f64 / required.len() as f64
        };

        let domain_score = self.domain_score(task);
        let skill_score = self.skill_score(task, &required);
        let embedding_score = f64::from(
            cosine_similarity(
                &task_embedding(&task.task_type, &task.description),
                self.base.embedding(),
            )
            .max(0.0),
        );

        let score = WEIGHT_CAPABILITY * capability_score
            + WEIGHT_DOMAIN * domain_score
            + WEIGHT_SKILL * skill_score
            + WEIGHT_EMBEDDING * embedding_score;

        let mut recommendations = Vec::new();
        if score < LOW_MATCH_THRESHOLD {
            if !missing.is_empty() {
                recommendations.push(format!(
                    "worker lacks required capabilities: {}",
                    missing.join(", ")
                ));
            }
            if domain_score < 0.5 {
                recommendations.push(format!(
                    "task is outside the worker's domains (primary: {})",
                    self.profile.primary_domain
                ));
            }
            if skill_score < 0.3 {
                recommendations
                    .push("no recorded skill proficiency for this kind of task".to_string());
            }
        }

        debug!(
            worker_id = %self.base.id(),
            task_id = %task.id,
            score,
            capability_score,
            domain_score,
            "scored task match"
        );

        TaskMatch {
            score,
            meets_minimum: missing.is_empty(),
            capability_score,
            domain_score,
            skill_score,
            embedding_score,
            matched_capabilities: matched,
            missing_capabilities: missing,
            recommendations,
        }
    }

    /// Domain alignment: explicit metadata wins, otherwise mentions in the
    /// task text are used as a weaker signal
    fn domain_score(&self, task: &Task) -> f64 {
        if let Some(domain) = task.metadata_str("domain") {
            if self.profile.is_primary(domain) {
                return 1.0;
            }
            if self.profile.is_secondary(domain) {
                return 0.6;
            }
            return 0.2;
        }

        let text = format!("{} {}", task.task_type, task.description).to_lowercase();
        if text.contains(&self.profile.primary_domain.to_lowercase()) {
            return 0.8;
        }
        if self
            .profile
            .secondary_domains
            .iter()
            .any(|d| text.contains(&d.to_lowercase()))
        {
            return 0.5;
        }
        0.4
    }

    /// Average proficiency over the skills the task touches; zero when the
    /// profile records none of them
    fn skill_score(&self, task: &Task, required: &[String]) -> f64 {
        let mut keys: Vec<&str> = required.iter().map(String::as_str).collect();
        if !keys.iter().any(|k| k.eq_ignore_ascii_case(&task.task_type)) {
            keys.push(task.task_type.as_str());
        }

        let mut sum = 0.0;
        let mut hits = 0usize;
        for key in keys {
            if let Some(proficiency) = self.profile.skills.get(key) {
                sum += *proficiency;
                hits += 1;
            }
        }
        if hits == 0 {
            0.0
        } else {
            sum / hits as f64
        }
    }

    async fn run_pipeline(&self, task: &Task) -> WorkerResult<TaskOutput> {
        let prepared = match &self.processor {
            Some(processor) => processor.preprocess(task.clone()).await?,
            None => task.clone(),
        };

        let ctx = ExecutionContext::new(self.base.id(), &task.id, CancelSignal::new());
        let output = self.base.executor().execute(&prepared, &ctx).await?;

        match &self.processor {
            Some(processor) => processor.postprocess(output).await,
            None => Ok(output),
        }
    }
}

#[async_trait]
impl Worker for SpecializedWorker {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn worker_type(&self) -> &str {
        self.base.worker_type()
    }

    fn config(&self) -> &WorkerConfig {
        self.base.config()
    }

    fn status(&self) -> WorkerStatus {
        self.base.status()
    }

    fn load(&self) -> f64 {
        self.base.load()
    }

    fn active_tasks(&self) -> usize {
        self.base.active_tasks()
    }

    fn metrics(&self) -> WorkerMetrics {
        self.base.metrics()
    }

    fn health(&self) -> WorkerHealth {
        self.base.health()
    }

    fn similarity(&self, embedding: &[f32]) -> f32 {
        self.base.similarity(embedding)
    }

    async fn initialize(&self) -> WorkerResult<()> {
        self.base.initialize().await
    }

    async fn execute_task(&self, task: Task) -> WorkerResult<TaskOutput> {
        self.base.begin_task(&task)?;
        let started = tokio::time::Instant::now();
        let outcome = self.run_pipeline(&task).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.base.finish_task(&task, outcome, elapsed_ms)
    }

    async fn shutdown(&self) -> WorkerResult<()> {
        self.base.shutdown().await
    }

    fn push_message(&self, message: WorkerMessage) {
        self.base.push_message(message)
    }

    fn drain_messages(&self) -> Vec<WorkerMessage> {
        self.base.drain_messages()
    }
}
