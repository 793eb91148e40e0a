use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

/// Line-oriented progress stream to the client.
///
/// Writes after the receiver went away are swallowed; after the first failed
/// send the sink stops trying. Clones share that state.
#[derive(Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<String>>,
    open: Arc<AtomicBool>,
}

impl ProgressSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sink = Self { tx: Some(tx), open: Arc::new(AtomicBool::new(true)) };
        (sink, rx)
    }

    /// A sink that goes nowhere.
    pub fn discard() -> Self {
        Self { tx: None, open: Arc::new(AtomicBool::new(false)) }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Send one line; a trailing newline is added.
    pub async fn line(&self, text: impl Into<String>) {
        let Some(tx) = &self.tx else { return };
        if !self.is_open() {
            return;
        }
        let mut text = text.into();
        text.push('\n');
        if tx.send(text).await.is_err() {
            debug!("Progress receiver gone, dropping further updates");
            self.open.store(false, Ordering::Relaxed);
        }
    }

    pub async fn warning(&self, text: impl std::fmt::Display) {
        self.line(format!("Warning: {text}")).await;
    }

    pub async fn error(&self, text: impl std::fmt::Display) {
        self.line(format!("Error: {text}")).await;
    }
}
