use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use velo_feed::{FeedError, FeedProvider, RawFeed};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Payload(RawFeed),
    Transport(String),
    Http(u16),
    Decode(String),
    /// Sleep, then answer with the payload.
    Slow(Duration, RawFeed),
}

/// Feed provider that replays a fixed script, then repeats its last payload.
#[derive(Default)]
pub struct ScriptedFeed {
    steps: Mutex<VecDeque<ScriptStep>>,
    last: Mutex<Option<RawFeed>>,
    fetches: Mutex<u64>,
}

impl ScriptedFeed {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn fetch_count(&self) -> u64 {
        *self.fetches.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn remember(&self, raw: &RawFeed) {
        *self.last.lock().unwrap_or_else(|p| p.into_inner()) = Some(raw.clone());
    }
}

#[async_trait::async_trait]
impl FeedProvider for ScriptedFeed {
    fn source_name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch(&self) -> Result<RawFeed, FeedError> {
        *self.fetches.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        let step = self
            .steps
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();

        match step {
            Some(ScriptStep::Payload(raw)) => {
                self.remember(&raw);
                Ok(raw)
            }
            Some(ScriptStep::Transport(msg)) => Err(FeedError::Transport(msg)),
            Some(ScriptStep::Http(status)) => Err(FeedError::Http { status }),
            Some(ScriptStep::Decode(msg)) => Err(FeedError::Decode(msg)),
            Some(ScriptStep::Slow(delay, raw)) => {
                tokio::time::sleep(delay).await;
                self.remember(&raw);
                Ok(raw)
            }
            None => self
                .last
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone()
                .ok_or_else(|| FeedError::Transport("script exhausted".to_string())),
        }
    }
}
