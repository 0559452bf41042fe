//! In-memory channel backend.
//!
//! Serves tests and single-host deployments; the real messaging backend is
//! a drop-in [`ChannelApi`] implementation outside this crate.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Channel, ChannelApi, ChannelError, Message};

#[derive(Debug, Default)]
struct State {
    channels: Vec<Channel>,
    messages: HashMap<String, Vec<Message>>,
    cursors: HashMap<String, String>,
    posted: Vec<(String, String)>,
}

/// Channel backend holding everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryChannelApi {
    state: Mutex<State>,
}

impl MemoryChannelApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel by name; the id is derived from the name.
    pub fn add_channel(&self, name: &str) -> String {
        let id = format!("C-{name}");
        let mut state = self.state.lock().unwrap();
        state.channels.push(Channel {
            id: id.clone(),
            name: name.to_owned(),
        });
        id
    }

    /// Inject an inbound message, assigning a monotonically increasing ts.
    pub fn inject(&self, channel_id: &str, user: Option<&str>, text: &str) {
        let mut state = self.state.lock().unwrap();
        let seq = state.messages.values().map(Vec::len).sum::<usize>() + 1;
        state
            .messages
            .entry(channel_id.to_owned())
            .or_default()
            .push(Message {
                channel_id: channel_id.to_owned(),
                ts: format!("{seq:020}"),
                user: user.map(String::from),
                text: text.to_owned(),
            });
    }

    /// Messages posted by the pipeline, in order.
    pub fn posted(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().posted.clone()
    }
}

#[async_trait]
impl ChannelApi for MemoryChannelApi {
    async fn list_channels(&self) -> Result<Vec<Channel>, ChannelError> {
        Ok(self.state.lock().unwrap().channels.clone())
    }

    async fn poll(
        &self,
        channel_id: &str,
        since: Option<&str>,
    ) -> Result<Vec<Message>, ChannelError> {
        let state = self.state.lock().unwrap();
        let all = state.messages.get(channel_id).cloned().unwrap_or_default();
        Ok(match since {
            Some(cursor) => all.into_iter().filter(|m| m.ts.as_str() > cursor).collect(),
            None => all,
        })
    }

    async fn post(&self, channel_id: &str, text: &str) -> Result<(), ChannelError> {
        self.state
            .lock()
            .unwrap()
            .posted
            .push((channel_id.to_owned(), text.to_owned()));
        Ok(())
    }

    async fn save_cursor(&self, channel_id: &str, ts: &str) -> Result<(), ChannelError> {
        self.state
            .lock()
            .unwrap()
            .cursors
            .insert(channel_id.to_owned(), ts.to_owned());
        Ok(())
    }

    async fn load_cursor(&self, channel_id: &str) -> Result<Option<String>, ChannelError> {
        Ok(self.state.lock().unwrap().cursors.get(channel_id).cloned())
    }
}
