use std::path::PathBuf;

use async_stream::stream;
use datum_client::Sample;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncRead, BufReader},
};

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

enum Input {
    File(PathBuf),
    Stdin,
}

/// Samples read one JSON object per line, from a file or stdin.
///
/// Blank lines are skipped. A line that does not parse is reported as an
/// error item and reading continues with the next line.
pub struct NdjsonSource {
    input: Input,
}

impl NdjsonSource {
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            input: Input::File(path.into()),
        }
    }

    pub fn stdin() -> Self {
        Self { input: Input::Stdin }
    }
}

#[async_trait::async_trait]
impl Source<Sample> for NdjsonSource {
    async fn stream(&self) -> EnvelopeStream<Sample> {
        let path = match &self.input {
            Input::File(p) => Some(p.clone()),
            Input::Stdin => None,
        };
        let s = stream! {
            let reader: Box<dyn AsyncRead + Send + Unpin> = match &path {
                Some(p) => match File::open(p).await {
                    Ok(f) => Box::new(f),
                    Err(e) => {
                        yield Err(PipelineError::Source(format!(
                            "failed to open {}: {e}",
                            p.display()
                        )));
                        return;
                    }
                },
                None => Box::new(tokio::io::stdin()),
            };
            let mut lines = BufReader::new(reader).lines();
            let mut line_no: u64 = 0;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(PipelineError::Source(format!("failed to read line: {e}")));
                        break;
                    }
                };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Sample>(&line) {
                    Ok(sample) => yield Ok(Envelope::now(sample)),
                    Err(e) => {
                        metrics::counter!("ndjson_parse_errors_total").increment(1);
                        yield Err(PipelineError::Source(format!(
                            "line {line_no}: invalid sample json: {e}"
                        )));
                    }
                }
            }
        };
        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;

    #[tokio::test]
    async fn reads_samples_and_reports_bad_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"source_id":"meter-1","ts":"2024-01-01T00:00:00Z","instantaneous":{{"watts":5.0}}}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(
            file,
            r#"{{"source_id":"meter-1","ts":"2024-01-01T00:00:01Z","tags":["a"]}}"#
        )
        .unwrap();

        let items: Vec<_> = NdjsonSource::file(file.path()).stream().await.collect().await;
        assert_eq!(items.len(), 3);
        let first = items[0].as_ref().unwrap();
        assert_eq!(first.payload.source_id, "meter-1");
        assert_eq!(first.payload.instantaneous.get("watts"), Some(&5.0));
        assert!(matches!(&items[1], Err(PipelineError::Source(msg)) if msg.starts_with("line 3")));
        assert!(items[2].as_ref().unwrap().payload.tags.contains("a"));
    }

    #[tokio::test]
    async fn missing_file_yields_single_error() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<_> = NdjsonSource::file(dir.path().join("missing.ndjson"))
            .stream()
            .await
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }
}
