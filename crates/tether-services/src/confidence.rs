//! Confidence gate: decides whether a local answer must go to the cloud.
//!
//! Order of decision: any trigger keyword in the prompt escalates; otherwise a
//! similarity score below the threshold escalates; otherwise the local answer
//! stands. The score is computed in every case so the details stay complete.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use tether_core::config::ConfidenceConfig;
use tether_core::message::ConfidenceAssessment;
use tether_core::Payload;

use crate::capability::{ScoreDetail, SimilarityScorer};

/// Normalised trigger phrases: lower-cased, trimmed, no empties, no repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordSet {
    keywords: Vec<String>,
}

impl KeywordSet {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for kw in keywords {
            let kw = kw.as_ref().trim().to_lowercase();
            if !kw.is_empty() && !out.contains(&kw) {
                out.push(kw);
            }
        }
        Self { keywords: out }
    }

    /// Read a JSON list of strings. A missing or unusable file yields an
    /// empty set; neither is fatal.
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "keyword trigger file not found, no keywords loaded");
                return Self::default();
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to read keyword trigger file");
                return Self::default();
            }
        };
        match serde_json::from_str::<Vec<String>>(&text) {
            Ok(list) => {
                let set = Self::new(list);
                tracing::info!(path = %path.display(), count = set.len(), "keyword triggers loaded");
                set
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "keyword trigger file is not a JSON list of strings");
                Self::default()
            }
        }
    }

    /// Keywords contained in `text`, in list order. Case-insensitive.
    pub fn matches(&self, text: &str) -> Vec<String> {
        if self.keywords.is_empty() || text.is_empty() {
            return Vec::new();
        }
        let lower = text.to_lowercase();
        self.keywords
            .iter()
            .filter(|kw| lower.contains(kw.as_str()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.keywords
    }
}

pub struct ConfidenceGate {
    threshold: f64,
    keywords: RwLock<Arc<KeywordSet>>,
    source: Option<PathBuf>,
    scorer: Arc<dyn SimilarityScorer>,
}

impl ConfidenceGate {
    pub fn new(threshold: f64, keywords: KeywordSet, scorer: Arc<dyn SimilarityScorer>) -> Self {
        Self {
            threshold,
            keywords: RwLock::new(Arc::new(keywords)),
            source: None,
            scorer,
        }
    }

    /// Build from configuration, loading the keyword file once.
    pub fn from_config(config: &ConfidenceConfig, scorer: Arc<dyn SimilarityScorer>) -> Self {
        let keywords = KeywordSet::load(&config.keyword_triggers_file);
        Self {
            source: Some(config.keyword_triggers_file.clone()),
            ..Self::new(config.similarity_threshold, keywords, scorer)
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn keywords(&self) -> Arc<KeywordSet> {
        Arc::clone(&self.keywords.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Re-read the keyword file this gate was built from. Returns the new
    /// keyword count; a gate without a file keeps its current set.
    pub fn reload_keywords(&self) -> usize {
        let Some(path) = &self.source else {
            return self.keywords().len();
        };
        let fresh = Arc::new(KeywordSet::load(path));
        let count = fresh.len();
        *self.keywords.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        count
    }

    pub fn assess(&self, generated_text: &str, original_prompt: &str) -> ConfidenceAssessment {
        let found = self.keywords().matches(original_prompt);

        let ScoreDetail { score, raw } = if generated_text.trim().is_empty() || original_prompt.trim().is_empty() {
            ScoreDetail { score: 0.0, raw: None }
        } else {
            self.scorer.score_with_detail(generated_text, original_prompt)
        };
        let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };

        let (escalate, reason) = if !found.is_empty() {
            (true, format!("keyword trigger(s) in prompt: {}", found.join(", ")))
        } else if score < self.threshold {
            (
                true,
                format!("similarity score {score:.4} below threshold {}", self.threshold),
            )
        } else {
            (false, "high confidence: score at or above threshold, no keyword triggers".to_string())
        };

        let preview: String = original_prompt.chars().take(100).collect();
        tracing::info!(
            escalate,
            score,
            keywords = ?found,
            prompt = %preview,
            "confidence assessed"
        );

        let mut details = Payload::new();
        details.insert("similarity_score".into(), Value::from(score));
        details.insert(
            "keywords_in_prompt".into(),
            Value::Array(found.iter().cloned().map(Value::String).collect()),
        );
        details.insert("threshold_used".into(), Value::from(self.threshold));
        details.insert("reason".into(), Value::String(reason));
        if let Some(raw) = raw {
            details.insert("raw_scores".into(), raw);
        }

        ConfidenceAssessment {
            similarity_score: Some(score),
            keyword_triggers_found: found,
            requires_cloud_refinement: escalate,
            details,
        }
    }
}
