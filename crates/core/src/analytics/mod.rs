use crate::emotion::{ClassificationResult, EmotionLabel};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

const LOG_TARGET: &str = "analytics";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub label: EmotionLabel,
    pub confidence: f32,
    pub recorded_at_ms: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct LabelStat {
    pub label: EmotionLabel,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsSummary {
    pub total: u64,
    pub per_label: Vec<LabelStat>,
    pub most_detected: Option<LabelStat>,
    pub least_detected: Option<LabelStat>,
    pub distinct_users: usize,
}

impl AnalyticsSummary {
    /// Only labels that were detected at least once take part in the
    /// most/least ranking; ties go to the earlier label.
    pub fn from_records(records: &[AnalyticsRecord]) -> Self {
        let mut counts = [0u64; EmotionLabel::COUNT];
        for r in records {
            counts[r.label.index()] += 1;
        }
        let total: u64 = counts.iter().sum();

        let per_label: Vec<LabelStat> = EmotionLabel::ALL
            .iter()
            .zip(counts)
            .filter(|(_, count)| *count > 0)
            .map(|(&label, count)| LabelStat {
                label,
                count,
                percentage: count as f64 / total as f64 * 100.0,
            })
            .collect();

        let mut most: Option<LabelStat> = None;
        let mut least: Option<LabelStat> = None;
        for stat in &per_label {
            if most.map_or(true, |m| stat.count > m.count) {
                most = Some(*stat);
            }
            if least.map_or(true, |l| stat.count < l.count) {
                least = Some(*stat);
            }
        }

        let mut users: Vec<&str> = records.iter().filter_map(|r| r.user.as_deref()).collect();
        users.sort_unstable();
        users.dedup();

        Self {
            total,
            per_label,
            most_detected: most,
            least_detected: least,
            distinct_users: users.len(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AnalyticsError {
    #[error("analytics io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("analytics file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize analytics: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only log of classification results in one JSON file.
///
/// Every read-modify-write runs under one async lock and lands via a
/// temp-file rename, so concurrent requests never lose or tear records.
#[derive(Debug)]
pub struct AnalyticsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AnalyticsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(
        &self,
        result: &ClassificationResult,
        user: Option<&str>,
    ) -> Result<AnalyticsRecord, AnalyticsError> {
        let record = AnalyticsRecord {
            user: user.map(str::to_owned),
            label: result.label(),
            confidence: result.confidence(),
            recorded_at_ms: now_ms(),
        };

        let _guard = self.lock.lock().await;
        let mut records = self.read_unlocked().await?;
        records.push(record.clone());
        self.write_unlocked(&records).await?;

        tracing::debug!(
            target: LOG_TARGET,
            label = %record.label,
            user = record.user.as_deref().unwrap_or("-"),
            total = records.len(),
            "recorded detection"
        );
        Ok(record)
    }

    pub async fn records(&self) -> Result<Vec<AnalyticsRecord>, AnalyticsError> {
        let _guard = self.lock.lock().await;
        self.read_unlocked().await
    }

    pub async fn summary(&self) -> Result<AnalyticsSummary, AnalyticsError> {
        Ok(AnalyticsSummary::from_records(&self.records().await?))
    }

    async fn read_unlocked(&self) -> Result<Vec<AnalyticsRecord>, AnalyticsError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(AnalyticsError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&raw).map_err(|source| AnalyticsError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    async fn write_unlocked(&self, records: &[AnalyticsRecord]) -> Result<(), AnalyticsError> {
        let json = serde_json::to_vec_pretty(records)?;
        let io_err = |source| AnalyticsError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
