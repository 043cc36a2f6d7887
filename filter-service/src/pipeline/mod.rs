use std::{pin::Pin, sync::Arc, time::SystemTime};

use datum_client::Sample;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::filters::FilterChain;

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("filter worker error: {0}")]
    Worker(String),
    #[error("sink error: {0}")]
    Sink(String),
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> EnvelopeStream<T>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

/// Stable worker index for a source id, so every sample of one source is
/// filtered in order by the same worker.
pub fn shard_index(source_id: &str, workers: usize) -> usize {
    let hash = blake3::hash(source_id.as_bytes());
    let mut first = [0u8; 8];
    first.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(first) % workers.max(1) as u64) as usize
}

/// Reads samples from `source`, runs each through `chain` on one of
/// `workers` tasks, and hands whatever survives to `sink`.
pub struct Pipeline<S, K> {
    pub source: S,
    pub chain: Arc<FilterChain>,
    pub sink: K,
    pub workers: usize,
    pub channel_capacity: usize,
}

impl<S, K> Pipeline<S, K>
where
    S: Source<Sample> + Send + Sync + 'static,
    K: Sink<Sample> + Send + Sync + 'static,
{
    pub async fn run(self) -> Result<(), PipelineError> {
        let workers = self.workers.max(1);
        let capacity = self.channel_capacity.max(1);

        let (out_tx, out_rx) = mpsc::channel::<Result<Envelope<Sample>, PipelineError>>(capacity);
        let sink = self.sink;
        let sink_task = tokio::spawn(async move {
            sink.run(tokio_stream::wrappers::ReceiverStream::new(out_rx))
                .await
        });

        let mut txs = Vec::with_capacity(workers);
        let mut joins = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, mut rx) = mpsc::channel::<Envelope<Sample>>(capacity);
            txs.push(tx);

            let chain = self.chain.clone();
            let out = out_tx.clone();
            joins.push(tokio::spawn(async move {
                while let Some(env) = rx.recv().await {
                    let Envelope {
                        payload,
                        received_at,
                    } = env;
                    // Filters write their state through blocking store calls.
                    let chain = chain.clone();
                    let filtered =
                        match tokio::task::spawn_blocking(move || chain.apply(Arc::new(payload))).await {
                            Ok(filtered) => filtered,
                            Err(e) => {
                                tracing::error!(worker, error = %e, "filter chain panicked; sample dropped");
                                continue;
                            }
                        };
                    let Some(sample) = filtered.sample else {
                        continue;
                    };
                    let payload = Arc::try_unwrap(sample).unwrap_or_else(|shared| (*shared).clone());
                    if out
                        .send(Ok(Envelope {
                            payload,
                            received_at,
                        }))
                        .await
                        .is_err()
                    {
                        tracing::warn!(worker, "sink closed; filter worker stopping");
                        break;
                    }
                }
            }));
        }
        drop(out_tx);

        let mut input = self.source.stream().await;
        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable input");
                    continue;
                }
            };
            let idx = shard_index(&env.payload.source_id, workers);
            if txs[idx].send(env).await.is_err() {
                // Workers only stop early once the sink has gone away.
                drop(txs);
                return match sink_task.await {
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(())) => Err(PipelineError::Worker("filter worker channel closed".to_string())),
                    Err(e) => Err(PipelineError::Sink(format!("sink task join error: {e}"))),
                };
            }
        }
        drop(txs);

        for j in joins {
            j.await
                .map_err(|e| PipelineError::Worker(format!("filter worker join error: {e}")))?;
        }

        match sink_task.await {
            Ok(res) => res,
            Err(e) => Err(PipelineError::Sink(format!("sink task join error: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::tests::test_context;
    use crate::filters::{SampleFilter, SourceThrottleConfig, SourceThrottlingFilter};
    use time::macros::datetime;
    use tokio::sync::Mutex;

    struct VecSource(Vec<Sample>);

    #[async_trait::async_trait]
    impl Source<Sample> for VecSource {
        async fn stream(&self) -> EnvelopeStream<Sample> {
            let items: Vec<_> = self.0.iter().cloned().map(|s| Ok(Envelope::now(s))).collect();
            Box::pin(futures::stream::iter(items))
        }
    }

    #[derive(Clone, Default)]
    struct CollectSink(Arc<Mutex<Vec<Sample>>>);

    #[async_trait::async_trait]
    impl Sink<Sample> for CollectSink {
        async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
        where
            S: Stream<Item = Result<Envelope<Sample>, PipelineError>> + Send + Unpin + 'static,
        {
            while let Some(item) = input.next().await {
                self.0.lock().await.push(item?.payload);
            }
            Ok(())
        }
    }

    fn samples() -> Vec<Sample> {
        let start = datetime!(2024-01-01 00:00:00 UTC);
        (0..20)
            .map(|i| {
                let source = if i % 2 == 0 { "even" } else { "odd" };
                Sample::new(source, start + time::Duration::milliseconds(i * 250))
                    .with_instantaneous("n", i as f64)
            })
            .collect()
    }

    #[test]
    fn shard_index_is_stable_and_in_range() {
        for workers in 1..8 {
            let a = shard_index("meter-1", workers);
            assert!(a < workers);
            assert_eq!(a, shard_index("meter-1", workers));
        }
        assert_eq!(shard_index("anything", 0), 0);
    }

    #[tokio::test]
    async fn passes_samples_through_empty_chain_in_source_order() {
        let sink = CollectSink::default();
        let pipeline = Pipeline {
            source: VecSource(samples()),
            chain: Arc::new(FilterChain::default()),
            sink: sink.clone(),
            workers: 3,
            channel_capacity: 4,
        };
        pipeline.run().await.unwrap();

        let out = sink.0.lock().await;
        assert_eq!(out.len(), 20);
        for source in ["even", "odd"] {
            let ns: Vec<f64> = out
                .iter()
                .filter(|s| s.source_id == source)
                .map(|s| s.instantaneous["n"])
                .collect();
            let mut sorted = ns.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            assert_eq!(ns, sorted);
        }
    }

    /// Fails on the first sample it receives.
    struct FailingSink;

    #[async_trait::async_trait]
    impl Sink<Sample> for FailingSink {
        async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
        where
            S: Stream<Item = Result<Envelope<Sample>, PipelineError>> + Send + Unpin + 'static,
        {
            input.next().await;
            Err(PipelineError::Sink("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn early_sink_failure_is_reported() {
        let many: Vec<Sample> = (0..500)
            .map(|i| Sample::new("meter", datetime!(2024-01-01 00:00:00 UTC)).with_instantaneous("n", i as f64))
            .collect();
        let err = Pipeline {
            source: VecSource(many),
            chain: Arc::new(FilterChain::default()),
            sink: FailingSink,
            workers: 1,
            channel_capacity: 1,
        }
        .run()
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Sink(msg) if msg == "disk full"));
    }

    /// Records the thread each sample is filtered on.
    #[derive(Default)]
    struct ThreadRecorder(parking_lot::Mutex<Vec<std::thread::ThreadId>>);

    impl SampleFilter for ThreadRecorder {
        fn uid(&self) -> &str {
            "threads"
        }

        fn filter(&self, sample: &Arc<Sample>, _: &crate::filters::Parameters) -> crate::filters::Filtered {
            self.0.lock().push(std::thread::current().id());
            crate::filters::Filtered::unchanged(sample)
        }
    }

    #[tokio::test]
    async fn chain_runs_off_the_runtime_thread() {
        let recorder = Arc::new(ThreadRecorder::default());
        let filters: Vec<Arc<dyn SampleFilter>> = vec![recorder.clone()];
        Pipeline {
            source: VecSource(samples()),
            chain: Arc::new(FilterChain::new(filters)),
            sink: CollectSink::default(),
            workers: 2,
            channel_capacity: 4,
        }
        .run()
        .await
        .unwrap();

        let runtime_thread = std::thread::current().id();
        let seen = recorder.0.lock();
        assert_eq!(seen.len(), 20);
        assert!(seen.iter().all(|id| *id != runtime_thread));
    }

    #[tokio::test]
    async fn dropped_samples_never_reach_the_sink() {
        let t = test_context();
        let throttle = SourceThrottlingFilter::new(
            &SourceThrottleConfig {
                uid: "throttle".into(),
                source_id_pattern: None,
                frequency_seconds: 1,
            },
            &t.ctx,
        )
        .unwrap();
        let filters: Vec<Arc<dyn SampleFilter>> = vec![Arc::new(throttle)];

        let sink = CollectSink::default();
        Pipeline {
            source: VecSource(samples()),
            chain: Arc::new(FilterChain::new(filters)),
            sink: sink.clone(),
            workers: 2,
            channel_capacity: 8,
        }
        .run()
        .await
        .unwrap();

        // 20 samples over 5s, alternating between two sources: each source
        // passes once per second.
        let out = sink.0.lock().await;
        assert_eq!(out.iter().filter(|s| s.source_id == "even").count(), 5);
        assert_eq!(out.iter().filter(|s| s.source_id == "odd").count(), 5);
    }
}
