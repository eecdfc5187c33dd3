use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// One event in a model token stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TokenEvent {
    Content(String),
    Error(String),
    Done,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = TokenEvent> + Send>>;

/// Interface to a text-generation engine. Concrete engines (llama.cpp, MLX,
/// remote APIs) live outside this crate; they only have to produce a token
/// stream ending in `Done` or `Error`.
pub trait LlmEngine: Send + Sync {
    fn name(&self) -> &str;

    fn stream(&self, prompt: &str) -> TokenStream;
}

/// A token stream holding the exclusive engine lease; dropping the stream
/// releases the engine to the next caller.
pub struct LeasedStream {
    inner: TokenStream,
    _permit: OwnedSemaphorePermit,
}

impl Stream for LeasedStream {
    type Item = TokenEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Wraps the engine as a single exclusive resource. The chat path and the
/// extraction worker are its only two clients; extraction additionally
/// yields to chat through the UI-active flag, so chat never waits long.
#[derive(Clone)]
pub struct LlmHandle {
    engine: Arc<dyn LlmEngine>,
    limiter: Arc<Semaphore>,
    stop_flag: Arc<AtomicBool>,
}

impl LlmHandle {
    pub fn new(engine: Arc<dyn LlmEngine>) -> Self {
        Self {
            engine,
            limiter: Arc::new(Semaphore::new(1)),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn engine_name(&self) -> String {
        self.engine.name().to_string()
    }

    /// Acquire the engine and open a token stream. Blocks until the engine
    /// is free.
    pub async fn stream(&self, prompt: &str) -> LeasedStream {
        let permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .expect("LLM semaphore closed");
        LeasedStream {
            inner: self.engine.stream(prompt),
            _permit: permit,
        }
    }

    /// Try to take the engine without waiting. Extraction uses this so it
    /// never queues behind an interactive generation.
    pub async fn try_stream(&self, prompt: &str) -> Option<LeasedStream> {
        let permit = self.limiter.clone().try_acquire_owned().ok()?;
        Some(LeasedStream {
            inner: self.engine.stream(prompt),
            _permit: permit,
        })
    }

    /// Global stop signal for the interactive stream; checked per chunk.
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub fn clear_stop(&self) {
        self.stop_flag.store(false, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Deterministic engine for unit tests: replies with pre-scripted
    /// responses in order, then repeats the last one.
    pub struct ScriptedEngine {
        responses: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedEngine {
        pub fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: std::sync::Mutex::new(
                    responses.into_iter().rev().map(String::from).collect(),
                ),
            }
        }
    }

    impl LlmEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn stream(&self, _prompt: &str) -> TokenStream {
            let text = {
                let mut responses = self.responses.lock().unwrap();
                if responses.len() > 1 {
                    responses.pop().unwrap()
                } else {
                    responses.last().cloned().unwrap_or_default()
                }
            };
            let mut events: Vec<TokenEvent> = text
                .split_inclusive(' ')
                .map(|chunk| TokenEvent::Content(chunk.to_string()))
                .collect();
            events.push(TokenEvent::Done);
            Box::pin(futures::stream::iter(events))
        }
    }
}
