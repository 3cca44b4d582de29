//! Host side of the progress callback.
//!
//! The host binds a TCP listener before spawning a plugin and hands the
//! bound address to the plugin as its callback address. A plugin may open
//! any number of connections and push one [`ProgressEntry`] per line.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::ProgressEntry;
use crate::Result;

pub struct ProgressListener {
    address: String,
    rx: mpsc::UnboundedReceiver<ProgressEntry>,
    accept_task: JoinHandle<()>,
}

impl ProgressListener {
    /// Bind `addr` (e.g. `127.0.0.1:0`) and start accepting connections.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let address = listener.local_addr()?.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("progress listener accept failed: {e}");
                        break;
                    }
                };
                debug!(%peer, "plugin connected to progress callback");
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stream).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ProgressEntry>(trimmed) {
                            Ok(entry) => {
                                if tx.send(entry).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("ignoring malformed progress entry: {e}"),
                        }
                    }
                });
            }
        });

        Ok(Self {
            address,
            rx,
            accept_task,
        })
    }

    /// The bound address, suitable for `CDS_PLUGIN_CALLBACK`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Entries received so far, in arrival order.
    pub fn drain(&mut self) -> Vec<ProgressEntry> {
        let mut entries = Vec::new();
        while let Ok(entry) = self.rx.try_recv() {
            entries.push(entry);
        }
        entries
    }

    /// Wait for the next entry.
    pub async fn recv(&mut self) -> Option<ProgressEntry> {
        self.rx.recv().await
    }

    /// Collect entries until none arrives within `grace`.
    ///
    /// Used after a run completes: entries pushed just before the plugin
    /// answered may still be in flight on the callback connection.
    pub async fn settle(&mut self, grace: std::time::Duration) -> Vec<ProgressEntry> {
        let mut entries = self.drain();
        while let Ok(Some(entry)) = tokio::time::timeout(grace, self.rx.recv()).await {
            entries.push(entry);
        }
        entries
    }
}

impl Drop for ProgressListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn receives_entries_in_order() {
        let mut listener = ProgressListener::bind("127.0.0.1:0").await.unwrap();
        let mut stream = TcpStream::connect(listener.address()).await.unwrap();
        stream
            .write_all(
                b"{\"step\":\"clone\",\"entries\":{\"ref\":\"main\"}}\n\n{\"step\":\"build\"}\n",
            )
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.step, "clone");
        assert_eq!(first.entries.get("ref").map(String::as_str), Some("main"));

        let second = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.step, "build");
        assert!(second.entries.is_empty());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let mut listener = ProgressListener::bind("127.0.0.1:0").await.unwrap();
        let mut stream = TcpStream::connect(listener.address()).await.unwrap();
        stream
            .write_all(b"garbage\n{\"step\":\"ok\"}\n")
            .await
            .unwrap();

        let entry = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.step, "ok");
        assert!(listener.drain().is_empty());
    }
}
