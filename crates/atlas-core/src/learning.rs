//! Learning recorder: process-wide outcome statistics per task signature.
//!
//! Every evaluated attempt appends one [`LearningRecord`]. The recorder keeps
//! a rolling window of scores per signature and flags `should_retrain` when
//! the window's mean drops below the configured bound. State is advisory and
//! append-only. Concurrent writers and readers see approximately consistent
//! values, which is all the strategy selector needs.
//!
//! [`LearningLog`] persists records as JSONL so a later process can replay
//! them into a fresh recorder.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::plan::StrategyKind;
use crate::types::{PipelineError, PipelineResult, TaskSignature};

/// Shared handle passed to every worker.
pub type LearningHandle = Arc<LearningRecorder>;

/// Learning log size before rotation (10 MB).
pub const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Rotated learning logs kept next to the live file.
pub const MAX_ROTATIONS: u32 = 5;

fn default_retrain_threshold() -> f64 {
    0.5
}

fn default_window() -> usize {
    10
}

fn default_min_samples() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Rolling score below which a signature is flagged.
    #[serde(default = "default_retrain_threshold")]
    pub retrain_threshold: f64,
    /// Number of most recent scores in the rolling mean.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Attempts required before a signature can be flagged at all.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            retrain_threshold: default_retrain_threshold(),
            window: default_window(),
            min_samples: default_min_samples(),
        }
    }
}

impl LearningConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if !(0.0..=1.0).contains(&self.retrain_threshold) {
            return Err(PipelineError::InvalidInput(format!(
                "retrain_threshold {} is outside [0, 1]",
                self.retrain_threshold
            )));
        }
        if self.window == 0 {
            return Err(PipelineError::InvalidInput("learning window must be at least 1".into()));
        }
        if self.min_samples > self.window {
            return Err(PipelineError::InvalidInput(format!(
                "min_samples {} exceeds the learning window {}; no signature could ever be flagged",
                self.min_samples, self.window
            )));
        }
        Ok(())
    }
}

/// What happened during an attempt, beyond its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFlags {
    pub strategy: StrategyKind,
    #[serde(default)]
    pub fell_back: bool,
    #[serde(default)]
    pub strict_failure: bool,
    #[serde(default)]
    pub met_threshold: bool,
    #[serde(default)]
    pub contract_changed: bool,
}

impl Default for RecordFlags {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::RuleBased,
            fell_back: false,
            strict_failure: false,
            met_threshold: false,
            contract_changed: false,
        }
    }
}

/// One persisted outcome. The on-disk shape is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRecord {
    pub signature: TaskSignature,
    pub timestamp: DateTime<Utc>,
    pub score: f64,
    #[serde(default)]
    pub flags: RecordFlags,
}

impl LearningRecord {
    pub fn new(signature: TaskSignature, score: f64, flags: RecordFlags) -> Self {
        Self {
            signature,
            timestamp: Utc::now(),
            score: score.clamp(0.0, 1.0),
            flags,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SignatureStats {
    attempts: usize,
    score_sum: f64,
    recent: VecDeque<f64>,
    ai_assisted: usize,
    fallbacks: usize,
    strict_failures: usize,
    last_seen: Option<DateTime<Utc>>,
}

impl SignatureStats {
    fn push(&mut self, record: &LearningRecord, window: usize) {
        self.attempts += 1;
        self.score_sum += record.score;
        self.recent.push_back(record.score);
        while self.recent.len() > window {
            self.recent.pop_front();
        }
        if record.flags.strategy == StrategyKind::AiAssisted {
            self.ai_assisted += 1;
        }
        if record.flags.fell_back {
            self.fallbacks += 1;
        }
        if record.flags.strict_failure {
            self.strict_failures += 1;
        }
        self.last_seen = Some(record.timestamp);
    }

    fn rolling_score(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        self.recent.iter().sum::<f64>() / self.recent.len() as f64
    }
}

/// Aggregate for one signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureReport {
    pub signature: TaskSignature,
    pub attempts: usize,
    pub rolling_score: f64,
    pub mean_score: f64,
    pub ai_assisted_share: f64,
    pub fallbacks: usize,
    pub strict_failures: usize,
    pub should_retrain: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningReport {
    pub total_records: usize,
    pub signatures: Vec<SignatureReport>,
    /// Signatures whose strategy weighting should shift.
    pub flagged: Vec<TaskSignature>,
}

#[derive(Debug, Default)]
pub struct LearningRecorder {
    config: LearningConfig,
    stats: DashMap<TaskSignature, SignatureStats>,
    total: AtomicUsize,
}

impl LearningRecorder {
    pub fn new(config: LearningConfig) -> Self {
        Self {
            config,
            stats: DashMap::new(),
            total: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    /// Append a record. Returns whether the signature is now flagged.
    pub fn record(&self, record: &LearningRecord) -> bool {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut entry = self.stats.entry(record.signature.clone()).or_default();
        let was_flagged = self.flagged(&entry);
        entry.push(record, self.config.window.max(1));
        let flagged = self.flagged(&entry);
        drop(entry);

        if flagged && !was_flagged {
            tracing::info!(
                "Signature {} flagged for retraining (score {:.2})",
                record.signature,
                record.score
            );
        } else {
            tracing::debug!("Recorded {:.2} for {}", record.score, record.signature);
        }
        flagged
    }

    /// Feed previously persisted records back in.
    pub fn replay<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = LearningRecord>,
    {
        let mut n = 0;
        for record in records {
            self.record(&record);
            n += 1;
        }
        n
    }

    fn flagged(&self, stats: &SignatureStats) -> bool {
        // The window caps how many scores are held.
        let needed = self.config.min_samples.clamp(1, self.config.window.max(1));
        stats.recent.len() >= needed
            && stats.rolling_score() < self.config.retrain_threshold
    }

    pub fn should_retrain(&self, signature: &TaskSignature) -> bool {
        self.stats
            .get(signature)
            .map(|s| self.flagged(&s))
            .unwrap_or(false)
    }

    pub fn rolling_score(&self, signature: &TaskSignature) -> Option<f64> {
        self.stats
            .get(signature)
            .filter(|s| !s.recent.is_empty())
            .map(|s| s.rolling_score())
    }

    pub fn attempts(&self, signature: &TaskSignature) -> usize {
        self.stats.get(signature).map(|s| s.attempts).unwrap_or(0)
    }

    pub fn stats(&self, signature: &TaskSignature) -> Option<SignatureReport> {
        self.stats.get(signature).map(|s| self.summarize(signature, &s))
    }

    fn summarize(&self, signature: &TaskSignature, s: &SignatureStats) -> SignatureReport {
        let attempts = s.attempts.max(1) as f64;
        SignatureReport {
            signature: signature.clone(),
            attempts: s.attempts,
            rolling_score: s.rolling_score(),
            mean_score: s.score_sum / attempts,
            ai_assisted_share: s.ai_assisted as f64 / attempts,
            fallbacks: s.fallbacks,
            strict_failures: s.strict_failures,
            should_retrain: self.flagged(s),
            last_seen: s.last_seen,
        }
    }

    pub fn total_records(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> LearningReport {
        let mut signatures: Vec<SignatureReport> = self
            .stats
            .iter()
            .map(|e| self.summarize(e.key(), e.value()))
            .collect();
        signatures.sort_by(|a, b| a.signature.cmp(&b.signature));
        let flagged = signatures
            .iter()
            .filter(|s| s.should_retrain)
            .map(|s| s.signature.clone())
            .collect();
        LearningReport {
            total_records: self.total_records(),
            signatures,
            flagged,
        }
    }
}

// ── Persistence ──────────────────────────────────────────────────────────────

/// Append-only JSONL learning log with size-based rotation.
pub struct LearningLog {
    file: File,
    path: PathBuf,
    current_size: u64,
    max_size: u64,
}

impl LearningLog {
    /// Open or create the log file.
    pub fn open(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            file,
            path,
            current_size,
            max_size: MAX_LOG_SIZE,
        })
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &LearningRecord) -> PipelineResult<()> {
        if self.current_size >= self.max_size {
            self.rotate()?;
        }
        let json = serde_json::to_string(record)?;
        writeln!(self.file, "{json}")?;
        self.file.flush()?;
        self.current_size += json.len() as u64 + 1;
        Ok(())
    }

    /// Rotate files: log → log.1, .1 → .2, dropping the oldest.
    fn rotate(&mut self) -> PipelineResult<()> {
        self.file.flush()?;
        let oldest = rotation_path(&self.path, MAX_ROTATIONS);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for i in (1..MAX_ROTATIONS).rev() {
            let from = rotation_path(&self.path, i);
            if from.exists() {
                std::fs::rename(&from, rotation_path(&self.path, i + 1))?;
            }
        }
        std::fs::rename(&self.path, rotation_path(&self.path, 1))?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.current_size = 0;
        tracing::debug!("Rotated learning log {}", self.path.display());
        Ok(())
    }

    /// Read every record, oldest rotation first. Malformed lines are skipped.
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Vec<LearningRecord>> {
        let path = path.as_ref();
        let mut files: Vec<PathBuf> = (1..=MAX_ROTATIONS)
            .rev()
            .map(|i| rotation_path(path, i))
            .collect();
        files.push(path.to_path_buf());

        let mut records = Vec::new();
        for file in files.iter().filter(|f| f.exists()) {
            let reader = BufReader::new(File::open(file)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LearningRecord>(&line) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!(
                        "Skipping malformed learning record {}:{}: {e}",
                        file.display(),
                        lineno + 1
                    ),
                }
            }
        }
        Ok(records)
    }

    /// Load a log into a fresh recorder. A missing file yields an empty one.
    pub fn replay(path: impl AsRef<Path>, config: LearningConfig) -> PipelineResult<LearningRecorder> {
        let recorder = LearningRecorder::new(config);
        let n = recorder.replay(Self::load(path)?);
        tracing::debug!("Replayed {n} learning records");
        Ok(recorder)
    }
}

/// `learning.jsonl` → `learning.jsonl.1`, `learning.jsonl.2`, …
fn rotation_path(base: &Path, index: u32) -> PathBuf {
    let name = format!(
        "{}.{index}",
        base.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("learning.jsonl")
    );
    base.with_file_name(name)
}
