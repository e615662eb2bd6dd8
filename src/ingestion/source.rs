//! Block sources

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::STDIN_SOURCE;
use crate::error::{Error, Result};
use crate::types::{OperationRecord, PositionClockSignal, SourceBlock};

/// Producer of source blocks
#[async_trait]
pub trait BlockSource: Send {
    /// Next block, or `None` once the source is exhausted.
    ///
    /// Recoverable errors concern a single block; the caller may keep
    /// reading afterwards.
    async fn next_block(&mut self) -> Result<Option<SourceBlock>>;
}

/// Block as it appears on the wire, before its entries are decoded
#[derive(Deserialize)]
struct RawBlock {
    #[serde(default)]
    clock: Option<Value>,
    #[serde(default)]
    operations: Vec<Value>,
}

/// Newline-delimited JSON blocks, one [`SourceBlock`] per line.
///
/// A line that is not valid UTF-8 or not a JSON object is reported as a
/// recoverable error. Inside a block, each operation is decoded on its own:
/// undecodable ones are dropped and counted in
/// [`SourceBlock::undecodable`], the rest of the block is kept.
pub struct JsonLinesSource<R> {
    reader: R,
    buf: Vec<u8>,
    line_number: u64,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    /// Wrap a buffered reader
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            line_number: 0,
        }
    }

    fn decode_block(&self, line: &str) -> Result<SourceBlock> {
        let raw: RawBlock = serde_json::from_str(line)
            .map_err(|e| Error::Serialization(format!("line {}: {}", self.line_number, e)))?;

        let clock = match raw.clock {
            None | Some(Value::Null) => None,
            Some(value) => match serde_json::from_value::<PositionClockSignal>(value) {
                Ok(clock) => Some(clock),
                Err(e) => {
                    warn!(line = self.line_number, error = %e, "Dropping undecodable clock");
                    None
                }
            },
        };

        let mut block = SourceBlock {
            clock,
            operations: Vec::with_capacity(raw.operations.len()),
            undecodable: 0,
        };
        for (index, value) in raw.operations.into_iter().enumerate() {
            match serde_json::from_value::<OperationRecord>(value) {
                Ok(record) => block.operations.push(record),
                Err(e) => {
                    warn!(
                        line = self.line_number,
                        index,
                        error = %e,
                        "Dropping undecodable operation"
                    );
                    block.undecodable += 1;
                }
            }
        }
        Ok(block)
    }

    /// Lines consumed so far, blank ones included
    pub fn line_number(&self) -> u64 {
        self.line_number
    }
}

#[async_trait]
impl<R> BlockSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_block(&mut self) -> Result<Option<SourceBlock>> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(None);
            }
            self.line_number += 1;

            let line = std::str::from_utf8(&self.buf).map_err(|e| {
                Error::Serialization(format!("line {}: invalid UTF-8: {}", self.line_number, e))
            })?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return self.decode_block(line).map(Some);
        }
    }
}

/// Blocks pushed through a tokio channel
pub struct ChannelSource {
    rx: mpsc::Receiver<SourceBlock>,
}

impl ChannelSource {
    /// Wrap a receiver; the source ends when every sender is dropped
    pub fn new(rx: mpsc::Receiver<SourceBlock>) -> Self {
        Self { rx }
    }

    /// Create a bounded channel and its source.
    ///
    /// A capacity of zero is raised to one.
    pub fn channel(capacity: usize) -> (mpsc::Sender<SourceBlock>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl BlockSource for ChannelSource {
    async fn next_block(&mut self) -> Result<Option<SourceBlock>> {
        Ok(self.rx.recv().await)
    }
}

/// Open the configured source: `-` reads stdin, anything else is a file path
pub async fn open_source(source: &str) -> Result<Box<dyn BlockSource>> {
    if source == STDIN_SOURCE {
        info!("Reading operations from stdin");
        return Ok(Box::new(JsonLinesSource::new(BufReader::new(
            tokio::io::stdin(),
        ))));
    }

    let file = tokio::fs::File::open(source).await?;
    info!(path = %source, "Reading operations from file");
    Ok(Box::new(JsonLinesSource::new(BufReader::new(file))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetricKind, OperationRecord, PositionClockSignal};

    #[tokio::test]
    async fn test_json_lines_skips_blank_lines() {
        let input = concat!(
            r#"{"clock":{"position":1,"timestamp_seconds":100},"operations":[{"name":"a","kind":"counter","operation":1}]}"#,
            "\n\n   \n",
            r#"{"operations":[]}"#,
            "\n"
        );
        let mut source = JsonLinesSource::new(input.as_bytes());

        let first = source.next_block().await.unwrap().unwrap();
        assert_eq!(first.clock, Some(PositionClockSignal::new(1, 100)));
        assert_eq!(first.operations.len(), 1);
        assert_eq!(first.operations[0].kind, MetricKind::Counter);

        let second = source.next_block().await.unwrap().unwrap();
        assert!(second.clock.is_none());
        assert!(source.next_block().await.unwrap().is_none());
        assert_eq!(source.line_number(), 4);
    }

    #[tokio::test]
    async fn test_json_lines_malformed_line_is_recoverable() {
        let input = "not json\n{\"operations\":[]}\n";
        let mut source = JsonLinesSource::new(input.as_bytes());

        let err = source.next_block().await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("line 1"));

        assert!(source.next_block().await.unwrap().is_some());
        assert!(source.next_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_source_ends_when_senders_drop() {
        let (tx, mut source) = ChannelSource::channel(4);
        tx.send(SourceBlock {
            operations: vec![OperationRecord::new("g", MetricKind::Gauge, 3, 1.0)],
            ..Default::default()
        })
        .await
        .unwrap();
        drop(tx);

        let block = source.next_block().await.unwrap().unwrap();
        assert_eq!(block.operations[0].name, "g");
        assert!(source.next_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_lines_invalid_utf8_is_recoverable() {
        let mut input = br#"{"operations":[{"name":"a","kind":"counter","operation":1}]}"#.to_vec();
        input.extend_from_slice(b"\n{\"operations\":[]}\xff\n");
        input.extend_from_slice(br#"{"operations":[{"name":"b","kind":"counter","operation":1}]}"#);
        let mut source = JsonLinesSource::new(input.as_slice());

        assert_eq!(source.next_block().await.unwrap().unwrap().operations[0].name, "a");

        let err = source.next_block().await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("line 2"));

        // Last line has no trailing newline
        assert_eq!(source.next_block().await.unwrap().unwrap().operations[0].name, "b");
        assert!(source.next_block().await.unwrap().is_none());
        assert_eq!(source.line_number(), 3);
    }

    #[tokio::test]
    async fn test_json_lines_keeps_decodable_operations() {
        let input = concat!(
            r#"{"clock":{"position":9,"timestamp_seconds":50},"operations":["#,
            r#"{"name":"ok_total","kind":"counter","operation":1},"#,
            r#"{"name":"x","kind":"untyped","operation":1},"#,
            r#"{"kind":"gauge","operation":3,"value":2},"#,
            r#"{"name":"g","kind":"gauge","operation":3,"value":2}"#,
            "]}\n"
        );
        let mut source = JsonLinesSource::new(input.as_bytes());

        let block = source.next_block().await.unwrap().unwrap();
        assert_eq!(block.clock, Some(PositionClockSignal::new(9, 50)));
        let names: Vec<&str> = block.operations.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["ok_total", "g"]);
        assert_eq!(block.undecodable, 2);
    }

    #[tokio::test]
    async fn test_json_lines_bad_clock_keeps_operations() {
        let input = r#"{"clock":{"position":"soon"},"operations":[{"name":"a","kind":"counter","operation":1}]}"#;
        let mut source = JsonLinesSource::new(input.as_bytes());

        let block = source.next_block().await.unwrap().unwrap();
        assert!(block.clock.is_none());
        assert_eq!(block.operations.len(), 1);
        assert_eq!(block.undecodable, 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_channel() {
        let (tx, mut source) = ChannelSource::channel(0);
        tx.send(SourceBlock::default()).await.unwrap();
        drop(tx);

        assert!(source.next_block().await.unwrap().is_some());
        assert!(source.next_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_source_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.jsonl");
        std::fs::write(&path, "{\"operations\":[]}\n").unwrap();

        let mut source = open_source(path.to_str().unwrap()).await.unwrap();
        assert!(source.next_block().await.unwrap().is_some());
        assert!(source.next_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_source_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = match open_source(dir.path().join("missing").to_str().unwrap()).await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(!err.is_recoverable());
    }
}
