// Guard Engine
// Two-stage submit guard. The synchronous prefilter decides whether to block
// before anything can suspend; a blocked submit is then resolved by an
// enhanced assessment plus the remote tone service, under fail-open /
// fail-closed policy.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::models::{
    CacheEntry, CacheMode, CategoryWeights, DecideAction, DecideResponse, GuardMode, RiskAssessment, Verdict,
};
use crate::services::config_store::{FixedGuardMode, GuardConfig, GuardModeSource};
use crate::services::domain_policy::DomainPolicy;
use crate::services::list_store::ListStore;
use crate::services::providers::{ProviderError, ToneService, UnavailableToneService};
use crate::services::text_processor::normalize;

use super::pattern_compiler::{CompiledLexicon, PatternCompiler};
use super::result_cache::ResultCache;
use super::risk_scorer::RiskScorer;

// ============ Enhanced Scoring ============

/// Richer (possibly remote) second opinion on a blocked text
#[async_trait]
pub trait EnhancedScorer: Send + Sync {
    async fn assess(&self, text: &str) -> Result<RiskAssessment, ProviderError>;
}

/// Same algorithm as the prefilter, with the enhanced weight table
pub struct LocalEnhancedScorer {
    compiler: Arc<PatternCompiler>,
    lists: Arc<ListStore>,
    weights: CategoryWeights,
}

impl LocalEnhancedScorer {
    pub fn new(compiler: Arc<PatternCompiler>, lists: Arc<ListStore>, weights: CategoryWeights) -> Self {
        Self {
            compiler,
            lists,
            weights,
        }
    }
}

#[async_trait]
impl EnhancedScorer for LocalEnhancedScorer {
    async fn assess(&self, text: &str) -> Result<RiskAssessment, ProviderError> {
        let lexicon = self.compiler.compile().await;
        Ok(RiskScorer::new(lexicon, self.weights.clone()).score(text, &self.lists.snapshot()))
    }
}

// ============ Outcomes ============

pub fn verdict_for(config: &GuardConfig, assessment: &RiskAssessment) -> Verdict {
    if assessment.whitelisted || assessment.score <= config.pass_max {
        Verdict::Pass
    } else if assessment.score >= config.convert_min {
        Verdict::Convert
    } else {
        Verdict::Prompt
    }
}

/// Result of the synchronous prefilter
#[derive(Debug, Clone, PartialEq)]
pub enum QuickVerdict {
    Pass { assessment: RiskAssessment },
    Cached(CacheEntry),
    Block(RiskAssessment),
}

impl QuickVerdict {
    pub fn blocks(&self) -> bool {
        matches!(self, QuickVerdict::Block(_))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AllowReason {
    DomainDisabled,
    CachedSend,
    AcknowledgedWarning,
    Whitelisted,
    Pass,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HoldReason {
    ConversionFailed { retryable: bool },
    DecisionFailed,
}

/// Final action for a blocked submit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum GuardAction {
    Send,
    #[serde(rename_all = "camelCase")]
    Replace { converted_text: String, auto_send: bool },
    AwaitUser { verdict: Verdict, assessment: RiskAssessment },
    Hold { reason: HoldReason },
    /// The input context was cancelled or superseded
    Discarded,
}

/// What the host must do right now with a submit intent
#[derive(Debug)]
pub enum Submission {
    Allow(AllowReason),
    ApplyCached { converted_text: String },
    /// Duplicate while an evaluation for this context is pending
    Ignored,
    Blocked(PendingGuard),
}

// ============ Engine ============

struct ContextState {
    generation: u64,
    pending: bool,
    pending_key: String,
    pending_since: Instant,
    signal: watch::Sender<u64>,
}

impl ContextState {
    fn new() -> Self {
        let (signal, _) = watch::channel(0);
        Self {
            generation: 0,
            pending: false,
            pending_key: String::new(),
            pending_since: Instant::now(),
            signal,
        }
    }
}

struct Inner {
    config: GuardConfig,
    compiler: Arc<PatternCompiler>,
    lexicon: RwLock<Arc<CompiledLexicon>>,
    lists: Arc<ListStore>,
    domains: Arc<DomainPolicy>,
    cache: ResultCache,
    tone: Arc<dyn ToneService>,
    enhanced: Arc<dyn EnhancedScorer>,
    mode_source: Arc<dyn GuardModeSource>,
    mode_cache: Mutex<Option<(GuardMode, Instant)>>,
    contexts: Mutex<HashMap<String, ContextState>>,
    next_generation: AtomicU64,
    list_revision: AtomicU64,
}

pub struct GuardEngineBuilder {
    config: GuardConfig,
    compiler: Option<Arc<PatternCompiler>>,
    lists: Option<Arc<ListStore>>,
    domains: Option<Arc<DomainPolicy>>,
    tone: Option<Arc<dyn ToneService>>,
    enhanced: Option<Arc<dyn EnhancedScorer>>,
    mode_source: Option<Arc<dyn GuardModeSource>>,
}

impl GuardEngineBuilder {
    pub fn compiler(mut self, compiler: Arc<PatternCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn lists(mut self, lists: Arc<ListStore>) -> Self {
        self.lists = Some(lists);
        self
    }

    pub fn domains(mut self, domains: Arc<DomainPolicy>) -> Self {
        self.domains = Some(domains);
        self
    }

    pub fn tone_service(mut self, tone: Arc<dyn ToneService>) -> Self {
        self.tone = Some(tone);
        self
    }

    pub fn enhanced_scorer(mut self, enhanced: Arc<dyn EnhancedScorer>) -> Self {
        self.enhanced = Some(enhanced);
        self
    }

    pub fn guard_mode_source(mut self, source: Arc<dyn GuardModeSource>) -> Self {
        self.mode_source = Some(source);
        self
    }

    /// Compiles the lexicon up front so `submit` never waits on it
    pub async fn build(self) -> GuardEngine {
        let config = self.config;
        let compiler = self
            .compiler
            .unwrap_or_else(|| Arc::new(PatternCompiler::from_config(&config)));
        let lexicon = compiler.compile().await;
        if lexicon.is_degraded() {
            warn!("[guard] Running on the emergency lexicon, detection is degraded");
        }

        let lists = self.lists.unwrap_or_else(|| Arc::new(ListStore::in_memory()));
        let domains = self.domains.unwrap_or_else(|| Arc::new(DomainPolicy::in_memory()));
        let tone = self
            .tone
            .unwrap_or_else(|| Arc::new(UnavailableToneService) as Arc<dyn ToneService>);
        let enhanced = self.enhanced.unwrap_or_else(|| {
            Arc::new(LocalEnhancedScorer::new(
                Arc::clone(&compiler),
                Arc::clone(&lists),
                config.enhanced_weights.clone(),
            )) as Arc<dyn EnhancedScorer>
        });
        let mode_source = self
            .mode_source
            .unwrap_or_else(|| Arc::new(FixedGuardMode::new(config.guard_mode)) as Arc<dyn GuardModeSource>);

        info!(
            "[guard] Engine ready: {} patterns, pass_max={}, convert_min={}",
            lexicon.len(),
            config.pass_max,
            config.convert_min
        );

        GuardEngine {
            inner: Arc::new(Inner {
                cache: ResultCache::from_config(&config),
                config,
                compiler,
                lexicon: RwLock::new(lexicon),
                domains,
                tone,
                enhanced,
                mode_source,
                mode_cache: Mutex::new(None),
                contexts: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                list_revision: AtomicU64::new(lists.revision()),
                lists,
            }),
        }
    }
}

/// Handle to one guard engine; clones share state
#[derive(Clone)]
pub struct GuardEngine {
    inner: Arc<Inner>,
}

impl GuardEngine {
    pub fn builder(config: GuardConfig) -> GuardEngineBuilder {
        GuardEngineBuilder {
            config,
            compiler: None,
            lists: None,
            domains: None,
            tone: None,
            enhanced: None,
            mode_source: None,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.inner.config
    }

    pub fn lists(&self) -> &Arc<ListStore> {
        &self.inner.lists
    }

    pub fn domains(&self) -> &Arc<DomainPolicy> {
        &self.inner.domains
    }

    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn lexicon_degraded(&self) -> bool {
        self.inner.current_lexicon().is_degraded()
    }

    /// Prefilter score; never suspends
    pub fn score(&self, text: &str) -> RiskAssessment {
        self.inner.score(text)
    }

    /// Cache check then prefilter. A pass is cached as `send`.
    pub fn quick_assess(&self, text: &str) -> QuickVerdict {
        self.inner.quick_assess(text, &normalize(text))
    }

    /// Enhanced verdict for `text` in `mode`, outside any input context
    pub async fn enhanced_assess(&self, text: &str, mode: GuardMode) -> GuardAction {
        let quick = self.inner.score(text);
        let assessment = self.inner.enhanced_or(text, &quick).await;
        self.inner
            .decide_action(text, &normalize(text), assessment, mode)
            .await
    }

    /// Handle a submit intent. Runs to completion without suspending: the
    /// block decision is made before any asynchronous work exists.
    pub fn submit(&self, context: &str, domain: &str, text: &str) -> Submission {
        let inner = &self.inner;
        if !inner.domains.is_guard_active(domain, Utc::now()) {
            debug!("[guard] Guard off for {}, allowing", domain);
            return Submission::Allow(AllowReason::DomainDisabled);
        }

        let key = normalize(text);
        let Some((generation, signal)) = inner.reserve(context, &key) else {
            debug!("[guard] Evaluation pending for {}, ignoring submit", context);
            return Submission::Ignored;
        };

        match inner.quick_assess(text, &key) {
            QuickVerdict::Block(assessment) => {
                info!(
                    "[guard] Blocked submit context={} len={} score={} level={:?}",
                    context,
                    text.chars().count(),
                    assessment.score,
                    assessment.risk_level
                );
                Submission::Blocked(PendingGuard {
                    inner: Arc::clone(inner),
                    context: context.to_string(),
                    generation,
                    text: text.to_string(),
                    key,
                    quick: assessment,
                    signal,
                })
            }
            QuickVerdict::Cached(CacheEntry {
                mode, converted_text, ..
            }) => {
                inner.release(context, generation);
                match (mode, converted_text) {
                    (CacheMode::Convert, Some(converted_text)) => Submission::ApplyCached { converted_text },
                    (CacheMode::WarningAcknowledged, _) => Submission::Allow(AllowReason::AcknowledgedWarning),
                    _ => Submission::Allow(AllowReason::CachedSend),
                }
            }
            QuickVerdict::Pass { assessment } => {
                inner.release(context, generation);
                if assessment.whitelisted {
                    Submission::Allow(AllowReason::Whitelisted)
                } else {
                    Submission::Allow(AllowReason::Pass)
                }
            }
        }
    }

    /// Drop the context; a pending evaluation resolves to `Discarded`
    pub fn cancel_context(&self, context: &str) -> bool {
        let removed = self.inner.lock_contexts().remove(context);
        match removed {
            Some(state) => {
                if state.pending {
                    info!("[guard] Cancelled pending evaluation for {}", context);
                }
                state.pending
            }
            None => false,
        }
    }

    /// Record a "send anyway" choice. The next identical submit passes once.
    pub fn acknowledge_warning(&self, text: &str) {
        self.inner
            .cache
            .put(&normalize(text), CacheMode::WarningAcknowledged, None);
    }

    /// User-initiated conversion from a warn-mode prompt
    pub async fn request_conversion(&self, text: &str) -> GuardAction {
        let key = normalize(text);
        match self.inner.call_service("convert", self.inner.tone.convert(text)).await {
            Ok(converted) => self.inner.replacement(&key, converted),
            Err(e) => {
                warn!("[guard] Requested conversion failed: {}", e);
                GuardAction::Hold {
                    reason: HoldReason::ConversionFailed { retryable: true },
                }
            }
        }
    }

    /// Recompile from the lexicon sources; cached verdicts are dropped
    pub async fn reload_lexicon(&self) -> usize {
        let inner = &self.inner;
        inner.compiler.invalidate().await;
        let lexicon = inner.compiler.compile().await;
        let count = lexicon.len();
        *inner.lexicon.write().unwrap_or_else(|e| e.into_inner()) = lexicon;
        inner.cache.clear();
        info!("[guard] Lexicon reloaded: {} patterns", count);
        count
    }
}

impl Inner {
    fn current_lexicon(&self) -> Arc<CompiledLexicon> {
        match self.lexicon.read() {
            Ok(lexicon) => Arc::clone(&lexicon),
            Err(e) => Arc::clone(&e.into_inner()),
        }
    }

    fn lock_contexts(&self) -> MutexGuard<'_, HashMap<String, ContextState>> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn score(&self, text: &str) -> RiskAssessment {
        RiskScorer::new(self.current_lexicon(), self.config.prefilter_weights.clone())
            .score(text, &self.lists.snapshot())
    }

    /// Cached verdicts were computed against the old lists
    fn sync_list_revision(&self) {
        let current = self.lists.revision();
        if self.list_revision.swap(current, Ordering::SeqCst) != current {
            debug!("[guard] Lists changed, dropping cached verdicts");
            self.cache.clear();
        }
    }

    fn quick_assess(&self, text: &str, key: &str) -> QuickVerdict {
        self.sync_list_revision();
        if let Some(entry) = self.cache.lookup(key) {
            if entry.mode != CacheMode::Convert || entry.converted_text.is_some() {
                return QuickVerdict::Cached(entry);
            }
            self.cache.remove(key);
        }
        let assessment = self.score(text);
        if verdict_for(&self.config, &assessment) == Verdict::Pass {
            self.cache.put(key, CacheMode::Send, None);
            QuickVerdict::Pass { assessment }
        } else {
            QuickVerdict::Block(assessment)
        }
    }

    /// Claim the context for a new evaluation. None while another one is
    /// pending for the same text or inside the debounce window.
    fn reserve(&self, context: &str, key: &str) -> Option<(u64, watch::Receiver<u64>)> {
        let now = Instant::now();
        let debounce = Duration::from_millis(self.config.debounce_ms);
        let mut contexts = self.lock_contexts();
        let state = contexts
            .entry(context.to_string())
            .or_insert_with(ContextState::new);
        if state.pending
            && (state.pending_key == key || now.duration_since(state.pending_since) < debounce)
        {
            return None;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        state.generation = generation;
        state.pending = true;
        state.pending_key = key.to_string();
        state.pending_since = now;
        // Supersedes any older evaluation still waiting on this context
        state.signal.send_replace(generation);
        Some((generation, state.signal.subscribe()))
    }

    /// Forget the context once its current evaluation is done
    fn release(&self, context: &str, generation: u64) {
        let mut contexts = self.lock_contexts();
        if contexts.get(context).is_some_and(|state| state.generation == generation) {
            contexts.remove(context);
        }
    }

    async fn guard_mode(&self) -> GuardMode {
        let ttl = Duration::from_secs(self.config.guard_mode_cache_secs);
        let cached = {
            let slot = self.mode_cache.lock().unwrap_or_else(|e| e.into_inner());
            (*slot).filter(|(_, at)| at.elapsed() < ttl).map(|(mode, _)| mode)
        };
        if let Some(mode) = cached {
            return mode;
        }
        let mode = self.mode_source.guard_mode().await;
        *self.mode_cache.lock().unwrap_or_else(|e| e.into_inner()) = Some((mode, Instant::now()));
        mode
    }

    /// Enhanced assessment bounded by the enhanced timeout; the quick result
    /// stands in on failure or timeout
    async fn enhanced_or(&self, text: &str, quick: &RiskAssessment) -> RiskAssessment {
        let limit = Duration::from_millis(self.config.enhanced_timeout_ms);
        match tokio::time::timeout(limit, self.enhanced.assess(text)).await {
            Ok(Ok(assessment)) => assessment,
            Ok(Err(e)) => {
                warn!("[guard] Enhanced assessment failed, using quick result: {}", e);
                quick.clone()
            }
            Err(_) => {
                warn!(
                    "[guard] Enhanced assessment timed out after {}ms, using quick result",
                    limit.as_millis()
                );
                quick.clone()
            }
        }
    }

    async fn call_service<T, F>(&self, what: &str, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let ms = self.config.service_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(ms), fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("[guard] {} timed out after {}ms", what, ms);
                Err(ProviderError::Timeout(ms))
            }
        }
    }

    async fn decide_action(&self, text: &str, key: &str, assessment: RiskAssessment, mode: GuardMode) -> GuardAction {
        let verdict = verdict_for(&self.config, &assessment);
        info!(
            "[guard] Verdict {:?} mode={:?} score={} level={:?}",
            verdict, mode, assessment.score, assessment.risk_level
        );
        match (verdict, mode) {
            (Verdict::Pass, _) => {
                self.cache.put(key, CacheMode::Send, None);
                GuardAction::Send
            }
            (_, GuardMode::Warn) => GuardAction::AwaitUser { verdict, assessment },
            (Verdict::Convert, GuardMode::Convert) => self.convert_text(text, key).await,
            (Verdict::Prompt, GuardMode::Convert) => self.decide_text(text, key).await,
        }
    }

    async fn convert_text(&self, text: &str, key: &str) -> GuardAction {
        match self.call_service("convert", self.tone.convert(text)).await {
            Ok(converted) => self.replacement(key, converted),
            Err(e) if self.config.fail_open_on_convert_error => {
                warn!("[guard] Conversion failed, sending unchanged: {}", e);
                GuardAction::Send
            }
            Err(e) => {
                warn!("[guard] Conversion failed, holding message: {}", e);
                GuardAction::Hold {
                    reason: HoldReason::ConversionFailed {
                        retryable: e.is_retryable(),
                    },
                }
            }
        }
    }

    async fn decide_text(&self, text: &str, key: &str) -> GuardAction {
        match self.call_service("decide", self.tone.decide(text)).await {
            Ok(DecideResponse {
                action: DecideAction::Send,
                ..
            }) => {
                self.cache.put(key, CacheMode::Send, None);
                GuardAction::Send
            }
            Ok(DecideResponse {
                action: DecideAction::Convert,
                converted_text: Some(converted),
            }) => self.replacement(key, converted),
            Ok(DecideResponse {
                action: DecideAction::Convert,
                converted_text: None,
            }) => self.convert_text(text, key).await,
            Err(e) if self.config.fail_open_on_decision_error => {
                warn!("[guard] Decision failed, sending: {}", e);
                GuardAction::Send
            }
            Err(e) => {
                warn!("[guard] Decision failed, holding message: {}", e);
                GuardAction::Hold {
                    reason: HoldReason::DecisionFailed,
                }
            }
        }
    }

    /// Converted text is only cached when it will be auto-sent
    fn replacement(&self, key: &str, converted: String) -> GuardAction {
        let auto_send = self.config.auto_send_converted;
        if auto_send {
            self.cache.put(key, CacheMode::Convert, Some(converted.clone()));
        }
        GuardAction::Replace {
            converted_text: converted,
            auto_send,
        }
    }
}

// ============ Pending Evaluation ============

/// A blocked submit waiting for its enhanced verdict. Dropping it releases
/// the context without acting.
pub struct PendingGuard {
    inner: Arc<Inner>,
    context: String,
    generation: u64,
    text: String,
    key: String,
    quick: RiskAssessment,
    signal: watch::Receiver<u64>,
}

impl fmt::Debug for PendingGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingGuard")
            .field("context", &self.context)
            .field("generation", &self.generation)
            .field("score", &self.quick.score)
            .finish()
    }
}

impl PendingGuard {
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn quick_assessment(&self) -> &RiskAssessment {
        &self.quick
    }

    pub async fn resolve(self) -> GuardAction {
        let action = tokio::select! {
            biased;
            _ = superseded(self.signal.clone(), self.generation) => GuardAction::Discarded,
            action = self.evaluate() => action,
        };
        if action == GuardAction::Discarded {
            debug!("[guard] Discarded stale evaluation for {}", self.context);
        }
        action
    }

    async fn evaluate(&self) -> GuardAction {
        let inner = &self.inner;
        let (assessment, mode) = tokio::join!(inner.enhanced_or(&self.text, &self.quick), inner.guard_mode());
        inner.decide_action(&self.text, &self.key, assessment, mode).await
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.release(&self.context, self.generation);
    }
}

/// Completes once the context moves past `generation` or disappears
async fn superseded(mut signal: watch::Receiver<u64>, generation: u64) {
    loop {
        if signal.changed().await.is_err() {
            return;
        }
        if *signal.borrow_and_update() != generation {
            return;
        }
    }
}
