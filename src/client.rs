//! HTTP client for the admin API of a running `devgate up`

use crate::instance::StackStatus;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("devgate is not running (no admin API at {0})")]
    NotRunning(String),

    #[error("admin API returned {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("admin API request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read admin API response: {0}")]
    Body(#[from] hyper::Error),

    #[error("invalid admin API response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid admin API request: {0}")]
    Build(#[from] hyper::http::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct AdminClient {
    base_url: String,
    token: Option<String>,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl AdminClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    async fn send(&self, method: Method, path: &str) -> Result<Response<Incoming>, ClientError> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.base_url, path))
            .header("User-Agent", concat!("devgate/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = &self.token {
            builder = builder.header(hyper::header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = builder.body(Empty::<Bytes>::new())?;

        match self.client.request(req).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_connect() => Err(ClientError::NotRunning(self.base_url.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: Response<Incoming>) -> Result<T, ClientError> {
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                message: error_message(&body),
            });
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Current status of every service, or `None` when nothing is running
    pub async fn status(&self) -> Result<Option<StackStatus>, ClientError> {
        match self.send(Method::GET, "/services").await {
            Ok(response) => Ok(Some(Self::read_json(response).await?)),
            Err(ClientError::NotRunning(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Ask the running stack to shut down; returns false when nothing is running
    pub async fn shutdown(&self) -> Result<bool, ClientError> {
        match self.send(Method::POST, "/shutdown").await {
            Ok(response) => {
                let _: serde_json::Value = Self::read_json(response).await?;
                Ok(true)
            }
            Err(ClientError::NotRunning(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Copy a service's captured output to `out`, following new lines when `follow` is set
    pub async fn stream_logs<W>(&self, name: &str, follow: bool, out: &mut W) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let path = if follow {
            format!("/logs/{}", name)
        } else {
            format!("/logs/{}?follow=false", name)
        };
        let response = self.send(Method::GET, &path).await?;

        let status = response.status();
        let mut body = response.into_body();
        if !status.is_success() {
            let bytes = body.collect().await?.to_bytes();
            return Err(ClientError::Status {
                status,
                message: error_message(&bytes),
            });
        }

        while let Some(frame) = body.frame().await {
            if let Ok(data) = frame?.into_data() {
                out.write_all(&data).await?;
                out.flush().await?;
            }
        }
        Ok(())
    }
}

fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}
