use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{RecoError, Result};
use crate::model::{
    ConsumerId, ProductId, ProductPair, RecommendSettings, Recommendation, Snapshot,
};
use crate::recommender::Recommender;

/// One consumer's slice of a [`Recommender::recommend_batch`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerRequest {
    pub consumer: ConsumerId,
    pub candidates: Vec<ProductId>,
}

#[derive(Debug, Clone, Copy)]
enum CallClass {
    Interactive,
    Bulk,
}

/// What gets logged when a reader call fails.
struct RequestContext<'a> {
    op: &'static str,
    consumer: Option<ConsumerId>,
    seeds: &'a [ProductId],
    candidates: &'a [ProductId],
    batch: &'a [ConsumerRequest],
    requests: usize,
}

impl<'a> RequestContext<'a> {
    fn new(op: &'static str) -> Self {
        Self {
            op,
            consumer: None,
            seeds: &[],
            candidates: &[],
            batch: &[],
            requests: 1,
        }
    }

    fn consumer(mut self, consumer: ConsumerId) -> Self {
        self.consumer = Some(consumer);
        self
    }

    fn seeds(mut self, seeds: &'a [ProductId]) -> Self {
        self.seeds = seeds;
        self
    }

    fn candidates(mut self, candidates: &'a [ProductId]) -> Self {
        self.candidates = candidates;
        self
    }

    fn batch(mut self, batch: &'a [ConsumerRequest]) -> Self {
        self.batch = batch;
        self.requests = batch.len();
        self
    }
}

impl Recommender {
    /// Rank `candidates` for `consumer`. Unknown candidates and candidates the
    /// consumer already had an excluded event for are dropped; an unknown
    /// consumer is scored as a cold profile.
    pub async fn recommend(
        &self,
        consumer: ConsumerId,
        candidates: &[ProductId],
        settings: &RecommendSettings,
    ) -> Result<Vec<Recommendation>> {
        let started = Instant::now();
        let result = self.try_recommend(consumer, candidates, settings).await;
        let ctx = RequestContext::new("recommend")
            .consumer(consumer)
            .candidates(candidates);
        self.report(ctx, started, result)
    }

    /// Rank `candidates` by similarity to `seeds`. Seeds are never returned.
    pub async fn similar(
        &self,
        seeds: &[ProductId],
        candidates: &[ProductId],
        settings: &RecommendSettings,
    ) -> Result<Vec<Recommendation>> {
        let started = Instant::now();
        let result = self.try_similar(seeds, candidates, settings).await;
        let ctx = RequestContext::new("similar")
            .seeds(seeds)
            .candidates(candidates);
        self.report(ctx, started, result)
    }

    /// Two products to show a consumer side by side, or `None` when fewer
    /// than two unseen products are left.
    pub async fn get_next_pair(&self, consumer: ConsumerId) -> Result<Option<ProductPair>> {
        let started = Instant::now();
        let result = self
            .acquire(CallClass::Interactive, "get_next_pair")
            .await
            .map(|live| live.next_pair(consumer));
        self.report(
            RequestContext::new("get_next_pair").consumer(consumer),
            started,
            result,
        )
    }

    pub async fn needs_profiling(&self, consumer: ConsumerId) -> Result<bool> {
        let started = Instant::now();
        let result = self
            .acquire(CallClass::Interactive, "needs_profiling")
            .await
            .map(|live| live.needs_profiling(consumer));
        self.report(
            RequestContext::new("needs_profiling").consumer(consumer),
            started,
            result,
        )
    }

    /// Answer many consumers against one generation. Scoring runs on a
    /// blocking thread.
    pub async fn recommend_batch(
        &self,
        requests: Vec<ConsumerRequest>,
        settings: &RecommendSettings,
    ) -> Result<Vec<Vec<Recommendation>>> {
        let started = Instant::now();
        let requests = Arc::new(requests);
        let result = self.try_recommend_batch(requests.clone(), settings).await;
        self.report(
            RequestContext::new("recommend_batch").batch(&requests),
            started,
            result,
        )
    }

    async fn try_recommend(
        &self,
        consumer: ConsumerId,
        candidates: &[ProductId],
        settings: &RecommendSettings,
    ) -> Result<Vec<Recommendation>> {
        validate(settings)?;
        let live = self.acquire(CallClass::Interactive, "recommend").await?;
        Ok(live.recommend(
            consumer,
            candidates,
            settings,
            &self.core.config.excluded_events,
        ))
    }

    async fn try_similar(
        &self,
        seeds: &[ProductId],
        candidates: &[ProductId],
        settings: &RecommendSettings,
    ) -> Result<Vec<Recommendation>> {
        validate(settings)?;
        if seeds.is_empty() {
            return Err(RecoError::InvalidInput("no seed products given".to_string()));
        }
        let live = self.acquire(CallClass::Interactive, "similar").await?;
        Ok(live.similar(seeds, candidates, settings))
    }

    async fn try_recommend_batch(
        &self,
        requests: Arc<Vec<ConsumerRequest>>,
        settings: &RecommendSettings,
    ) -> Result<Vec<Vec<Recommendation>>> {
        validate(settings)?;
        let live = self.acquire(CallClass::Bulk, "recommend_batch").await?;
        let settings = settings.clone();
        let excluded = self.core.config.excluded_events.clone();
        tokio::task::spawn_blocking(move || {
            requests
                .iter()
                .map(|r| live.recommend(r.consumer, &r.candidates, &settings, &excluded))
                .collect()
        })
        .await
        .map_err(|e| RecoError::Internal(e.to_string()))
    }

    /// Clone the live handle under the shared lock, warning when the wait
    /// exceeded the threshold for this call class.
    async fn acquire(&self, class: CallClass, op: &'static str) -> Result<Arc<Snapshot>> {
        if self.shutdown.is_cancelled() {
            return Err(RecoError::ShuttingDown);
        }
        let started = Instant::now();
        let live = self
            .core
            .lock
            .read_interruptible(&self.shutdown)
            .await?
            .clone();
        let waited = started.elapsed();
        let threshold = self.threshold(class);
        if waited > threshold {
            tracing::warn!(
                recommender = %self.core.config.name,
                op,
                waited_ms = waited.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "Slow read lock acquisition, updates may be starving readers"
            );
        }
        live.ok_or(RecoError::NotReady)
    }

    fn threshold(&self, class: CallClass) -> Duration {
        let latency = &self.core.config.latency;
        match class {
            CallClass::Interactive => latency.interactive,
            CallClass::Bulk => latency.bulk,
        }
    }

    /// Log a failed call with its request context, then hand the result back.
    fn report<T>(&self, ctx: RequestContext<'_>, started: Instant, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            self.log_failure(&ctx, started, error);
        }
        result
    }

    fn log_failure(&self, ctx: &RequestContext<'_>, started: Instant, error: &RecoError) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if error.is_not_ready() {
            tracing::debug!(
                recommender = %self.core.config.name,
                op = ctx.op,
                consumer_id = ?ctx.consumer,
                elapsed_ms,
                "Reader call before first model"
            );
            return;
        }
        let batch_consumers: Vec<ConsumerId> = ctx.batch.iter().map(|r| r.consumer).collect();
        let batch_candidates: Vec<&[ProductId]> =
            ctx.batch.iter().map(|r| r.candidates.as_slice()).collect();
        tracing::error!(
            recommender = %self.core.config.name,
            op = ctx.op,
            consumer_id = ?ctx.consumer,
            seeds = ?ctx.seeds,
            candidates = ?ctx.candidates,
            batch_consumers = ?batch_consumers,
            batch_candidates = ?batch_candidates,
            requests = ctx.requests,
            elapsed_ms,
            error = %error,
            "Reader call failed"
        );
    }
}

fn validate(settings: &RecommendSettings) -> Result<()> {
    if settings.max_results == 0 {
        return Err(RecoError::InvalidInput(
            "max_results must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use tokio_util::sync::CancellationToken;
    use tracing::subscriber::DefaultGuard;

    use super::*;
    use crate::config::{LatencyThresholds, RecommenderConfig, WatchdogConfig};
    use crate::model::{Event, Product};
    use crate::reader::MemorySource;

    /// Log sink shared between the subscriber and the assertions.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn install(&self) -> DefaultGuard {
            let writer = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .with_max_level(tracing::Level::DEBUG)
                .finish();
            tracing::subscriber::set_default(subscriber)
        }

        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    async fn ready(interactive: Duration) -> Recommender {
        let source = MemorySource::new();
        source.upsert_product(Product::new(1, "a"));
        source.upsert_product(Product::new(2, "b"));
        source.push_events([Event::new(7, 1, "view")]);
        let config = RecommenderConfig::new("logged")
            .with_watchdog(WatchdogConfig::disabled())
            .with_latency(LatencyThresholds {
                interactive,
                bulk: Duration::from_secs(5),
            });
        let recommender = Recommender::start(config, source.reader(10));
        let state = recommender
            .initialize()
            .await
            .unwrap()
            .wait_until_finished()
            .await;
        assert!(state.is_success());
        recommender
    }

    #[tokio::test]
    async fn read_blocked_past_threshold_warns() {
        let captured = Captured::default();
        let _logging = captured.install();
        let recommender = ready(Duration::from_millis(20)).await;

        let settings = RecommendSettings::default();
        let holder = CancellationToken::new();
        let guard = recommender.core.lock.write("slow-writer", &holder).await.unwrap();
        let (results, ()) = tokio::join!(
            recommender.recommend(7, &[1, 2], &settings),
            async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                drop(guard);
            }
        );
        assert!(results.is_ok());

        let logs = captured.text();
        assert!(logs.contains("Slow read lock acquisition"), "{logs}");
        assert!(logs.contains("threshold_ms=20"), "{logs}");
    }

    #[tokio::test]
    async fn fast_read_does_not_warn() {
        let captured = Captured::default();
        let _logging = captured.install();
        let recommender = ready(Duration::from_secs(1)).await;
        recommender
            .recommend(7, &[1, 2], &RecommendSettings::default())
            .await
            .unwrap();
        assert!(!captured.text().contains("Slow read lock acquisition"));
    }

    #[tokio::test]
    async fn failed_batch_logs_every_consumer_and_candidate() {
        let captured = Captured::default();
        let _logging = captured.install();
        let recommender = ready(Duration::from_secs(1)).await;

        let requests = vec![
            ConsumerRequest {
                consumer: 41,
                candidates: vec![1, 2],
            },
            ConsumerRequest {
                consumer: 42,
                candidates: vec![2],
            },
        ];
        let err = recommender
            .recommend_batch(requests, &RecommendSettings::top(0))
            .await
            .unwrap_err();
        assert!(matches!(err, RecoError::InvalidInput(_)));

        let logs = captured.text();
        assert!(logs.contains("Reader call failed"), "{logs}");
        assert!(logs.contains("batch_consumers=[41, 42]"), "{logs}");
        assert!(logs.contains("batch_candidates=[[1, 2], [2]]"), "{logs}");
        assert!(logs.contains("requests=2"), "{logs}");
    }

    #[tokio::test]
    async fn failed_recommend_logs_consumer_and_candidates() {
        let captured = Captured::default();
        let _logging = captured.install();
        let recommender = ready(Duration::from_secs(1)).await;

        assert!(recommender
            .recommend(9, &[2, 1], &RecommendSettings::top(0))
            .await
            .is_err());
        let logs = captured.text();
        assert!(logs.contains("consumer_id=Some(9)"), "{logs}");
        assert!(logs.contains("candidates=[2, 1]"), "{logs}");
    }
}
