use async_trait::async_trait;
use log::debug;
use reqwest::{StatusCode, Url};

use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::room::{Message, MessageKind};

/// Persisted room history. User messages and system notices are stored
/// separately by the backend and fetched separately.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_messages(&self, room_id: &str) -> Result<Vec<Message>>;
    async fn fetch_system_messages(&self, room_id: &str) -> Result<Vec<Message>>;
}

pub struct RestHistory {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl RestHistory {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        RestHistory {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(&config.api_url, config.token.clone())
    }

    async fn get(&self, room_id: &str, collection: &str) -> Result<Vec<Message>> {
        let fetch_error = |reason: String| SyncError::Fetch {
            room_id: room_id.to_string(),
            reason,
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| fetch_error(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| fetch_error(format!("{} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(["chat", "rooms", room_id, collection]);

        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| fetch_error(e.to_string()))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(SyncError::Auth(format!("{} returned {}", url, response.status())));
            }
            status if !status.is_success() => {
                return Err(fetch_error(format!("{url} returned {status}")));
            }
            _ => {}
        }

        let messages: Vec<Message> = response
            .json()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        debug!("Fetched {} {} for room {}", messages.len(), collection, room_id);
        Ok(messages)
    }
}

#[async_trait]
impl HistorySource for RestHistory {
    async fn fetch_messages(&self, room_id: &str) -> Result<Vec<Message>> {
        self.get(room_id, "messages").await
    }

    async fn fetch_system_messages(&self, room_id: &str) -> Result<Vec<Message>> {
        let mut notices = self.get(room_id, "system-messages").await?;
        for notice in &mut notices {
            notice.kind = MessageKind::System;
        }
        Ok(notices)
    }
}
