use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decision::DecisionConfig;
use crate::scoring::ScoringConfig;

/// Liveness watchdog settings for the managed snapshot lock.
///
/// Every `probe_interval` the watchdog tries a non-blocking read. If that fails
/// it waits up to `grace` for a read lock before interrupting the writer. If the
/// writer still holds the lock after another `grace`, the watchdog escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub probe_interval: Duration,
    pub grace: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_interval: Duration::from_secs(30),
            grace: Duration::from_secs(60),
        }
    }
}

impl WatchdogConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Lock-wait durations above which reader calls log a starvation warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyThresholds {
    /// Single-consumer calls: recommend, similar, next pair, needs profiling.
    pub interactive: Duration,
    /// Multi-consumer calls such as `recommend_batch`.
    pub bulk: Duration,
}

impl Default for LatencyThresholds {
    fn default() -> Self {
        Self {
            interactive: Duration::from_millis(50),
            bulk: Duration::from_secs(5),
        }
    }
}

/// Intervals consumed by the periodic trigger in [`crate::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub update_interval: Duration,
    pub save_interval: Duration,
    /// How often the trigger wakes up to compare elapsed time with the intervals.
    pub tick: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(5 * 60),
            save_interval: Duration::from_secs(60 * 60),
            tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecommenderConfig {
    /// Name used in log fields; distinguishes instances hosted in one process.
    pub name: String,
    pub scoring: ScoringConfig,
    pub decision: DecisionConfig,
    /// Event kinds that remove a product from a consumer's candidates once they happened.
    pub excluded_events: Vec<String>,
    /// Target of `persist_now` and source of `initialize`.
    pub model_path: Option<PathBuf>,
    pub queue_capacity: usize,
    pub watchdog: WatchdogConfig,
    pub latency: LatencyThresholds,
    pub schedule: ScheduleConfig,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            scoring: ScoringConfig::default(),
            decision: DecisionConfig::default(),
            excluded_events: vec!["purchase".to_string()],
            model_path: None,
            queue_capacity: 64,
            watchdog: WatchdogConfig::default(),
            latency: LatencyThresholds::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl RecommenderConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_decision(mut self, decision: DecisionConfig) -> Self {
        self.decision = decision;
        self
    }

    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    pub fn with_excluded_events<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_events = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn with_latency(mut self, latency: LatencyThresholds) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.schedule = schedule;
        self
    }
}

/// Strategy selection as read from a JSON config file by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineFile {
    pub scoring: ScoringConfig,
    pub decision: DecisionConfig,
    pub excluded_events: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_config_default() {
        let cfg = WatchdogConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.probe_interval, Duration::from_secs(30));
        assert_eq!(cfg.grace, Duration::from_secs(60));
    }

    #[test]
    fn watchdog_config_disabled_keeps_timings() {
        let cfg = WatchdogConfig::disabled();
        assert!(!cfg.enabled);
        assert_eq!(cfg.probe_interval, Duration::from_secs(30));
    }

    #[test]
    fn latency_thresholds_default() {
        let cfg = LatencyThresholds::default();
        assert_eq!(cfg.interactive, Duration::from_millis(50));
        assert_eq!(cfg.bulk, Duration::from_secs(5));
    }

    #[test]
    fn recommender_config_default() {
        let cfg = RecommenderConfig::default();
        assert_eq!(cfg.name, "default");
        assert_eq!(cfg.excluded_events, vec!["purchase".to_string()]);
        assert!(cfg.model_path.is_none());
        assert_eq!(cfg.queue_capacity, 64);
    }

    #[test]
    fn recommender_config_builders() {
        let cfg = RecommenderConfig::new("shop")
            .with_model_path("/tmp/model.json")
            .with_excluded_events(["purchase", "return"])
            .with_watchdog(WatchdogConfig::disabled());
        assert_eq!(cfg.name, "shop");
        assert_eq!(cfg.model_path, Some(PathBuf::from("/tmp/model.json")));
        assert_eq!(cfg.excluded_events.len(), 2);
        assert!(!cfg.watchdog.enabled);
    }

    #[test]
    fn engine_file_parses_partial_json() {
        let file: EngineFile =
            serde_json::from_str(r#"{"excluded_events": ["view"]}"#).unwrap();
        assert_eq!(file.scoring, ScoringConfig::default());
        assert_eq!(file.excluded_events, Some(vec!["view".to_string()]));
    }
}
