use datum_client::Sample;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::pipeline::{Envelope, PipelineError, Sink};

/// Writes each sample as one JSON line.
pub struct NdjsonSink<W> {
    writer: Mutex<W>,
}

impl<W> NdjsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl NdjsonSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait::async_trait]
impl<W> Sink<Sample> for NdjsonSink<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<Sample>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut writer = self.writer.lock().await;
        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "error in upstream pipeline for NdjsonSink");
                    continue;
                }
            };

            let mut line = serde_json::to_vec(&env.payload)
                .map_err(|e| PipelineError::Sink(format!("failed to encode sample: {e}")))?;
            line.push(b'\n');
            writer
                .write_all(&line)
                .await
                .map_err(|e| PipelineError::Sink(format!("failed to write sample: {e}")))?;
            metrics::counter!("ndjson_samples_written_total").increment(1);
        }
        writer
            .flush()
            .await
            .map_err(|e| PipelineError::Sink(format!("failed to flush output: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn writes_one_line_per_sample_and_skips_errors() {
        let sink = NdjsonSink::new(Vec::<u8>::new());
        let items = vec![
            Ok(Envelope::now(
                Sample::new("a", datetime!(2024-01-01 00:00:00 UTC)).with_instantaneous("watts", 1.5),
            )),
            Err(PipelineError::Source("bad line".into())),
            Ok(Envelope::now(Sample::new("b", datetime!(2024-01-01 00:00:01 UTC)))),
        ];
        sink.run(futures::stream::iter(items)).await.unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Sample = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.instantaneous.get("watts"), Some(&1.5));
        assert!(lines[1].contains("\"source_id\":\"b\""));
    }
}
