use std::future::Future;
use std::ops::ControlFlow;

use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tracing::info;

use crate::channel::Channel;
use crate::config::ConnectOptions;
use crate::connection::{Connection, ConnectionState, StatsSnapshot};
use crate::error::{CableError, Result};
use crate::transport::dial;

pub struct Client {
    connection: Connection,
}

impl Client {
    pub async fn connect(url: &str, options: ConnectOptions) -> Result<Self> {
        options.validate()?;
        let ws = dial(url, &options).await?;
        let client = Self::connect_with(ws, options).await?;
        info!("connected to {url}");
        Ok(client)
    }

    pub async fn connect_with<S>(ws: WebSocketStream<S>, options: ConnectOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Connection::open(ws, options).await?;
        Ok(Self { connection })
    }

    pub async fn subscribe(&self, name: &str, params: Value) -> Result<Channel> {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(CableError::InvalidPayload(format!(
                    "subscription params must be an object, got {other}"
                )))
            }
        };
        self.connection.subscribe(name, params).await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.connection.stats()
    }

    pub fn options(&self) -> &ConnectOptions {
        self.connection.options()
    }

    pub async fn run_loop<F, Fut>(&self, mut body: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ControlFlow<()>>>,
    {
        while self.is_open() {
            if body().await?.is_break() {
                break;
            }
        }
        Ok(())
    }
}
