use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    domain::{ChannelPost, OutboundMessage},
    tasks::{
        sender::channel_key,
        transport::{MessageTransport, TransportError},
    },
};

#[derive(Debug, Clone)]
pub enum Step {
    Fail(TransportError),
    /// Sleeps before succeeding.
    Hang(Duration),
}

type SendHook = Box<dyn Fn(i64) + Send + Sync>;

/// In-memory transport: every chat succeeds unless a step was scripted for it.
/// Channel posts are scripted under `channel_key` of the channel.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<HashMap<i64, VecDeque<Step>>>,
    attempts: Mutex<Vec<i64>>,
    delivered: Mutex<Vec<(i64, OutboundMessage)>>,
    posts: Mutex<Vec<ChannelPost>>,
    after_delivery: Mutex<Option<SendHook>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, chat_id: i64, steps: impl IntoIterator<Item = Step>) {
        self.script
            .lock()
            .entry(chat_id)
            .or_default()
            .extend(steps);
    }

    pub fn after_delivery(&self, hook: impl Fn(i64) + Send + Sync + 'static) {
        *self.after_delivery.lock() = Some(Box::new(hook));
    }

    pub fn attempts(&self) -> Vec<i64> {
        self.attempts.lock().clone()
    }

    pub fn delivered(&self) -> Vec<i64> {
        self.delivered.lock().iter().map(|(id, _)| *id).collect()
    }

    pub fn posts(&self) -> Vec<ChannelPost> {
        self.posts.lock().clone()
    }

    fn next_step(&self, key: i64) -> Option<Step> {
        self.script.lock().get_mut(&key).and_then(|steps| steps.pop_front())
    }

    pub fn messages_to(&self, chat_id: i64) -> Vec<OutboundMessage> {
        self.delivered
            .lock()
            .iter()
            .filter(|(id, _)| *id == chat_id)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl MessageTransport for ScriptedTransport {
    async fn send(&self, chat_id: i64, message: &OutboundMessage) -> Result<(), TransportError> {
        self.attempts.lock().push(chat_id);
        match self.next_step(chat_id) {
            Some(Step::Fail(err)) => return Err(err),
            Some(Step::Hang(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }
        self.delivered.lock().push((chat_id, message.clone()));
        if let Some(hook) = self.after_delivery.lock().as_ref() {
            hook(chat_id);
        }
        Ok(())
    }

    async fn send_photo(&self, post: &ChannelPost) -> Result<(), TransportError> {
        match self.next_step(channel_key(&post.channel)) {
            Some(Step::Fail(err)) => return Err(err),
            Some(Step::Hang(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }
        self.posts.lock().push(post.clone());
        Ok(())
    }
}
