use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Destination for the supervised program's (and debugger's) output.
///
/// Cheap to clone; every relay task writes through the same lock so lines
/// from stdout and stderr interleave at chunk granularity.
#[derive(Clone)]
pub struct OutputSink {
    target: Arc<Mutex<Target>>,
}

enum Target {
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
    #[cfg(test)]
    Buffer(Vec<u8>),
}

impl OutputSink {
    /// Relay to this process's stdout.
    pub fn stdout() -> Self {
        Self::from_writer(tokio::io::stdout())
    }

    pub fn from_writer<W: AsyncWrite + Send + Unpin + 'static>(writer: W) -> Self {
        Self {
            target: Arc::new(Mutex::new(Target::Writer(Box::new(writer)))),
        }
    }

    /// In-memory sink, readable with [`OutputSink::snapshot`].
    #[cfg(test)]
    pub fn buffer() -> Self {
        Self {
            target: Arc::new(Mutex::new(Target::Buffer(Vec::new()))),
        }
    }

    pub async fn write(&self, data: &[u8]) {
        let mut target = self.target.lock().await;
        match &mut *target {
            Target::Writer(writer) => {
                // A closed terminal is not worth tearing the relay down for.
                if writer.write_all(data).await.is_ok() {
                    let _ = writer.flush().await;
                }
            }
            #[cfg(test)]
            Target::Buffer(buf) => buf.extend_from_slice(data),
        }
    }

    /// Everything written so far (empty for writer-backed sinks).
    #[cfg(test)]
    pub async fn snapshot(&self) -> Vec<u8> {
        match &*self.target.lock().await {
            Target::Writer(_) => Vec::new(),
            Target::Buffer(buf) => buf.clone(),
        }
    }
}

/// Copy a child stream into the sink until the pipe closes.
pub fn spawn_relay<R>(reader: R, sink: OutputSink)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        pipe_output(reader, sink).await;
    });
}

async fn pipe_output<R: AsyncRead + Unpin>(mut reader: R, sink: OutputSink) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.write(&buf[..n]).await,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffer_sink_collects_writes() {
        let sink = OutputSink::buffer();
        sink.write(b"hello ").await;
        sink.clone().write(b"world").await;
        assert_eq!(sink.snapshot().await, b"hello world");
    }

    #[tokio::test]
    async fn test_pipe_output_copies_until_eof() {
        let sink = OutputSink::buffer();
        let data: &[u8] = b"line one\nline two\n";
        pipe_output(data, sink.clone()).await;
        assert_eq!(sink.snapshot().await, b"line one\nline two\n");
    }

    #[tokio::test]
    async fn test_writer_sink_has_no_snapshot() {
        let sink = OutputSink::from_writer(tokio::io::sink());
        sink.write(b"discarded").await;
        assert!(sink.snapshot().await.is_empty());
    }
}
