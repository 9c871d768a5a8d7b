//! JSON-over-HTTP client for a remote broker service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::broker::{Broker, BrokerError, ChannelCounts, ChannelHandle, RawMessage};

#[derive(Debug, Serialize)]
struct CreateChannelRequest<'a> {
    name: &'a str,
    lease_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct CreateChannelResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct SendRequest {
    body: String,
    priority: u32,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: String,
}

#[derive(Debug, Serialize)]
struct ReceiveRequest {
    max_messages: usize,
    wait_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct ReceiveResponse {
    #[serde(default)]
    messages: Vec<RawMessage>,
}

/// [`Broker`] backed by a remote broker service.
#[derive(Debug, Clone)]
pub struct HttpBroker {
    http: reqwest::Client,
    base: Url,
}

impl HttpBroker {
    /// Create a client for the broker at `base` (e.g. `http://127.0.0.1:9324`).
    ///
    /// `http` should carry a request timeout longer than the longest receive wait.
    pub fn new(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BrokerError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BrokerError::Protocol(format!("broker url {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn transport(err: reqwest::Error) -> BrokerError {
    BrokerError::Unavailable(format!("{err:#}"))
}

async fn check(res: reqwest::Response, channel: &str) -> Result<reqwest::Response, BrokerError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(status_error(status, body, channel))
}

fn status_error(status: StatusCode, body: String, channel: &str) -> BrokerError {
    if status.is_server_error() {
        BrokerError::Unavailable(format!("http {status}: {body}"))
    } else if status == StatusCode::NOT_FOUND {
        BrokerError::ChannelNotFound(channel.to_string())
    } else {
        BrokerError::Protocol(format!("http {status}: {body}"))
    }
}

async fn decode<T: serde::de::DeserializeOwned>(res: reqwest::Response) -> Result<T, BrokerError> {
    res.json()
        .await
        .map_err(|err| BrokerError::Protocol(format!("decode response: {err:#}")))
}

#[async_trait]
impl Broker for HttpBroker {
    async fn create_channel(
        &self,
        name: &str,
        lease: Duration,
    ) -> Result<ChannelHandle, BrokerError> {
        let url = self.endpoint(&["api", "channels"])?;
        let res = self
            .http
            .post(url)
            .json(&CreateChannelRequest {
                name,
                lease_seconds: lease.as_secs().max(1),
            })
            .send()
            .await
            .map_err(transport)?;
        let created: CreateChannelResponse = decode(check(res, name).await?).await?;
        Ok(ChannelHandle {
            name: name.to_string(),
            id: created.id,
        })
    }

    async fn send(
        &self,
        channel: &ChannelHandle,
        body: String,
        priority: u32,
    ) -> Result<String, BrokerError> {
        let url = self.endpoint(&["api", "channels", &channel.id, "messages"])?;
        let res = self
            .http
            .post(url)
            .json(&SendRequest { body, priority })
            .send()
            .await
            .map_err(transport)?;
        let sent: SendResponse = decode(check(res, &channel.name).await?).await?;
        Ok(sent.message_id)
    }

    async fn receive(
        &self,
        channel: &ChannelHandle,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        let url = self.endpoint(&["api", "channels", &channel.id, "receive"])?;
        let res = self
            .http
            .post(url)
            .json(&ReceiveRequest {
                max_messages: max_messages.max(1),
                wait_seconds: wait.as_secs(),
            })
            .send()
            .await
            .map_err(transport)?;
        let batch: ReceiveResponse = decode(check(res, &channel.name).await?).await?;
        Ok(batch.messages)
    }

    async fn delete(&self, channel: &ChannelHandle, receipt: &str) -> Result<(), BrokerError> {
        let url = self.endpoint(&["api", "channels", &channel.id, "messages", receipt])?;
        let res = self.http.delete(url).send().await.map_err(transport)?;
        // Already deleted or lease superseded.
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(res, &channel.name).await?;
        Ok(())
    }

    async fn counts(&self, channel: &ChannelHandle) -> Result<ChannelCounts, BrokerError> {
        let url = self.endpoint(&["api", "channels", &channel.id, "counts"])?;
        let res = self.http.get(url).send().await.map_err(transport)?;
        decode(check(res, &channel.name).await?).await
    }

    async fn delete_channel(&self, channel: &ChannelHandle) -> Result<(), BrokerError> {
        let url = self.endpoint(&["api", "channels", &channel.id])?;
        let res = self.http.delete(url).send().await.map_err(transport)?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(res, &channel.name).await?;
        Ok(())
    }
}
