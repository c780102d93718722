use super::service::{
    ErrorResponse, GetResponse, GrantRequest, KeyRequest, LeaseRequest, LeaseResponse,
    PrefixRequest, PutRequest, RangeResponse, WriteResponse, WATCH_READY,
};
use super::{CoordinationService, KeyValue, LeaseId, WatchEvent, Watcher};
use crate::error::CoordError;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

fn http_error(err: reqwest::Error) -> CoordError {
    if err.is_timeout() {
        CoordError::Timeout
    } else {
        CoordError::Http(err)
    }
}

/// Client for a coordination service hosted over HTTP (see [`super::service::router`]).
#[derive(Clone)]
pub struct HttpCoordinator {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpCoordinator {
    /// `base_url` is the mount point, e.g. `http://localhost:8000/v1`.
    /// Every request, and every watch handshake, gives up after `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CoordError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            timeout,
        })
    }

    async fn call<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, CoordError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(http_error)?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(http_error);
        }
        let failure: ErrorResponse = response.json().await.map_err(|_| {
            CoordError::Protocol(format!("{} returned {}", path, status))
        })?;
        match failure.lease {
            Some(lease) if status == StatusCode::NOT_FOUND => Err(CoordError::LeaseExpired(lease)),
            _ => Err(CoordError::Protocol(failure.error)),
        }
    }

    fn watch_url(&self, key: &str) -> Result<Url, CoordError> {
        let mut url = Url::parse(&format!("{}/watch", self.base_url))
            .map_err(|e| CoordError::Protocol(e.to_string()))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| CoordError::Protocol(format!("cannot watch over {}", self.base_url)))?;
        url.query_pairs_mut().append_pair("key", key);
        Ok(url)
    }
}

#[async_trait]
impl CoordinationService for HttpCoordinator {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, CoordError> {
        let request = GrantRequest {
            ttl_ms: ttl.as_millis() as u64,
        };
        let response: LeaseResponse = self.call("/lease/grant", &request).await?;
        Ok(response.lease)
    }

    async fn refresh_lease(&self, lease: LeaseId) -> Result<(), CoordError> {
        let _: LeaseResponse = self.call("/lease/refresh", &LeaseRequest { lease }).await?;
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordError> {
        let _: LeaseResponse = self.call("/lease/revoke", &LeaseRequest { lease }).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, CoordError> {
        let request = KeyRequest { key: key.to_string() };
        let response: GetResponse = self.call("/kv/get", &request).await?;
        Ok(response.kv)
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, CoordError> {
        let request = PrefixRequest {
            prefix: prefix.to_string(),
        };
        let response: RangeResponse = self.call("/kv/range", &request).await?;
        Ok(response.kvs)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), CoordError> {
        let request = PutRequest {
            key: key.to_string(),
            value: value.to_string(),
            lease,
        };
        let _: WriteResponse = self.call("/kv/put", &request).await?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, CoordError> {
        let request = PutRequest {
            key: key.to_string(),
            value: value.to_string(),
            lease,
        };
        let response: WriteResponse = self.call("/kv/create", &request).await?;
        Ok(response.changed)
    }

    async fn delete(&self, key: &str) -> Result<bool, CoordError> {
        let request = KeyRequest { key: key.to_string() };
        let response: WriteResponse = self.call("/kv/delete", &request).await?;
        Ok(response.changed)
    }

    async fn watch(&self, key: &str) -> Result<Watcher, CoordError> {
        let url = self.watch_url(key)?;
        let handshake = async {
            let mut stream = match connect_async(url.as_str()).await {
                Ok((stream, _response)) => stream,
                Err(e) => return Err(CoordError::from(e)),
            };
            // Events are only guaranteed after the service registered the watch.
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) if text == WATCH_READY => return Ok(stream),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(CoordError::from(e)),
                    None => return Err(CoordError::Closed),
                }
            }
        };
        let mut stream = tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| CoordError::Timeout)??;

        let (tx, rx) = mpsc::unbounded_channel();
        let key = key.to_string();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = tx.closed() => break,
                    frame = stream.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<WatchEvent>(&text) {
                        Ok(event) => {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Malformed watch event on {}: {}", key, e),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Watch stream on {} failed: {}", key, e);
                        break;
                    }
                }
            }
            let _ = stream.close(None).await;
            debug!("Watch on {} closed", key);
        });

        Ok(Watcher::new(rx))
    }
}
