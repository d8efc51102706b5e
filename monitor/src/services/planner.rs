use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::entity::monitoring_subscriptions;
use tokio::sync::Mutex;
use tracing::info;

use super::registry::SubscriptionRegistry;

/// Firings averaged when adapting the target size.
pub const METRICS_WINDOW: usize = 10;
const SLOW_BATCH_MS: f64 = 45_000.0;
const FAST_BATCH_MS: f64 = 15_000.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerConfig {
    pub target_batch_size: usize,
    pub min_batch_size: usize,
    pub min_target_size: usize,
    pub max_target_size: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            target_batch_size: 50,
            min_batch_size: 10,
            min_target_size: 20,
            max_target_size: 100,
        }
    }
}

/// A group of analyses checked together by one scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub analysis_ids: Vec<String>,
    pub estimated_strategy_count: usize,
    pub estimated_user_count: usize,
    pub target_frequency_seconds: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPerformanceMetrics {
    pub batch_id: String,
    pub processing_time_ms: u64,
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<String>,
}

impl BatchPerformanceMetrics {
    pub fn error_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            0.0
        } else {
            self.error_count as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct AnalysisLoad {
    analysis_id: String,
    strategy_ids: BTreeSet<String>,
    subscriber_count: usize,
    min_frequency: u32,
}

impl AnalysisLoad {
    fn complexity(&self) -> usize {
        self.strategy_ids.len() + self.subscriber_count
    }
}

/// Groups live subscriptions into batches of analyses.
///
/// Heaviest analyses go first and fill batches greedily up to the target size. Undersized
/// batches are then folded into a neighbour and oversized ones cut into target-sized chunks.
pub fn plan_batches(
    subscriptions: &[monitoring_subscriptions::Model],
    config: &PlannerConfig,
    now: DateTime<Utc>,
) -> Vec<Batch> {
    let mut by_analysis: BTreeMap<&str, AnalysisLoad> = BTreeMap::new();
    for sub in subscriptions.iter().filter(|s| s.is_live(now)) {
        let load = by_analysis.entry(sub.analysis_id.as_str()).or_insert_with(|| AnalysisLoad {
            analysis_id: sub.analysis_id.clone(),
            strategy_ids: BTreeSet::new(),
            subscriber_count: 0,
            min_frequency: u32::MAX,
        });
        load.strategy_ids.insert(sub.strategy_id.clone());
        load.subscriber_count += sub.subscribers.len();
        load.min_frequency = load.min_frequency.min(sub.config.frequency_seconds);
    }

    let mut loads: Vec<AnalysisLoad> = by_analysis.into_values().collect();
    // stable: ties keep analysis id order
    loads.sort_by(|a, b| b.complexity().cmp(&a.complexity()));

    let target = config.target_batch_size.max(1);
    let mut groups: Vec<Vec<AnalysisLoad>> = Vec::new();
    for load in loads {
        match groups.last_mut() {
            Some(group) if group.len() < target => group.push(load),
            _ => groups.push(vec![load]),
        }
    }

    let groups = split_oversized(merge_undersized(groups, config.min_batch_size), target);

    groups
        .into_iter()
        .enumerate()
        .map(|(i, group)| to_batch(i + 1, group))
        .collect()
}

fn merge_undersized(groups: Vec<Vec<AnalysisLoad>>, min_size: usize) -> Vec<Vec<AnalysisLoad>> {
    let mut merged: Vec<Vec<AnalysisLoad>> = Vec::with_capacity(groups.len());
    for group in groups {
        match merged.last_mut() {
            Some(previous) if group.len() < min_size => previous.extend(group),
            _ => merged.push(group),
        }
    }
    // only the first group has no predecessor to fold into
    if merged.len() > 1 && merged[0].len() < min_size {
        let mut first = merged.remove(0);
        first.extend(merged.remove(0));
        merged.insert(0, first);
    }
    merged
}

fn split_oversized(groups: Vec<Vec<AnalysisLoad>>, target: usize) -> Vec<Vec<AnalysisLoad>> {
    let mut out = Vec::with_capacity(groups.len());
    for group in groups {
        if group.len() * 2 > target * 3 {
            out.extend(group.chunks(target).map(<[AnalysisLoad]>::to_vec));
        } else {
            out.push(group);
        }
    }
    out
}

fn to_batch(index: usize, group: Vec<AnalysisLoad>) -> Batch {
    let estimated_strategy_count = group.iter().map(|l| l.strategy_ids.len()).sum();
    let estimated_user_count = group.iter().map(|l| l.subscriber_count).sum();
    let target_frequency_seconds = group.iter().map(|l| l.min_frequency).min().unwrap_or(u32::MAX);
    Batch {
        batch_id: format!("batch_{}", index),
        analysis_ids: group.into_iter().map(|l| l.analysis_id).collect(),
        estimated_strategy_count,
        estimated_user_count,
        target_frequency_seconds,
    }
}

/// Next target size from recent timings and the latest firing's error rate.
pub fn adapt_target_size(config: &PlannerConfig, avg_processing_ms: f64, error_rate: f64) -> usize {
    let mut target = config.target_batch_size;
    if avg_processing_ms > SLOW_BATCH_MS {
        target = target.saturating_sub(10);
    } else if avg_processing_ms < FAST_BATCH_MS && error_rate < 0.05 {
        target += 10;
    }
    if error_rate > 0.10 {
        target = target.saturating_sub(5);
    }
    target.clamp(config.min_target_size, config.max_target_size)
}

struct PlannerState {
    config: PlannerConfig,
    recent: VecDeque<BatchPerformanceMetrics>,
}

/// Owns the planner configuration and adapts it between planning cycles.
pub struct BatchPlanner {
    state: Mutex<PlannerState>,
}

impl BatchPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            state: Mutex::new(PlannerState {
                config,
                recent: VecDeque::with_capacity(METRICS_WINDOW),
            }),
        }
    }

    pub async fn config(&self) -> PlannerConfig {
        self.state.lock().await.config.clone()
    }

    pub async fn plan(&self, registry: &SubscriptionRegistry) -> Result<Vec<Batch>> {
        let now = Utc::now();
        let subscriptions = registry.find_live(now).await?;
        let config = self.config().await;
        let batches = plan_batches(&subscriptions, &config, now);
        info!(
            "📦 Planned {} batch(es) for {} subscription(s), target size {}",
            batches.len(),
            subscriptions.len(),
            config.target_batch_size
        );
        Ok(batches)
    }

    /// Feeds one firing into the controller. Returns the target size the next plan will use.
    pub async fn record_metrics(&self, metrics: &BatchPerformanceMetrics) -> usize {
        let mut state = self.state.lock().await;
        if state.recent.len() == METRICS_WINDOW {
            state.recent.pop_front();
        }
        state.recent.push_back(metrics.clone());

        let avg_ms = state.recent.iter().map(|m| m.processing_time_ms as f64).sum::<f64>()
            / state.recent.len() as f64;
        let next = adapt_target_size(&state.config, avg_ms, metrics.error_rate());
        if next != state.config.target_batch_size {
            info!(
                "⚙️ Batch target size {} -> {} (avg {:.0}ms, error rate {:.1}%)",
                state.config.target_batch_size,
                next,
                avg_ms,
                metrics.error_rate() * 100.0
            );
            state.config.target_batch_size = next;
        }
        next
    }
}
