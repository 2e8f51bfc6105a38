//! # Live Feed Client
//!
//! `LiveFeed` over a WebSocket. Each `connect` opens
//! `<stream_url>?track=<tag>,<tag>` and yields every text frame that decodes
//! as a `FeedItem`. Frames that do not decode are logged and skipped.

use async_trait::async_trait;
use futures_util::{StreamExt, future};
use lib_tagwall::core::TagSet;
use lib_tagwall::{FeedError, FeedItem, FeedStream, LiveFeed};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use url::Url;

pub struct WsLiveFeed {
    stream_url: Url,
    auth_token: Option<String>,
}

impl WsLiveFeed {
    pub fn new(stream_url: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            stream_url: Url::parse(stream_url)?,
            auth_token,
        })
    }

    /// The stream URL filtered to `tags`.
    pub fn filter_url(&self, tags: &TagSet) -> Url {
        let track = tags.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(",");
        let mut url = self.stream_url.clone();
        url.query_pairs_mut().append_pair("track", &track);
        url
    }
}

/// Turns one WebSocket frame into a stream element. `None` skips the frame.
fn decode_frame(frame: Result<WsMessage, tokio_tungstenite::tungstenite::Error>) -> Option<Result<FeedItem, FeedError>> {
    match frame {
        Ok(WsMessage::Text(text)) => match serde_json::from_str::<FeedItem>(text.as_str()) {
            Ok(item) => Some(Ok(item)),
            Err(e) => {
                log::warn!("Skipping undecodable frame: {}", e);
                None
            }
        },
        Ok(WsMessage::Binary(data)) => match serde_json::from_slice::<FeedItem>(&data) {
            Ok(item) => Some(Ok(item)),
            Err(e) => {
                log::warn!("Skipping undecodable binary frame ({} bytes): {}", data.len(), e);
                None
            }
        },
        Ok(WsMessage::Close(frame)) => {
            log::info!("Upstream sent close: {:?}", frame);
            None
        }
        Ok(_) => None,
        Err(e) => Some(Err(FeedError::Stream(e.to_string()))),
    }
}

#[async_trait]
impl LiveFeed for WsLiveFeed {
    async fn connect(&self, tags: &TagSet) -> Result<FeedStream, FeedError> {
        let url = self.filter_url(tags);
        log::info!("Connecting to live stream: {}", url);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| FeedError::Connect(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        log::info!("Connected to live stream");

        Ok(ws_stream
            .filter_map(|frame| future::ready(decode_frame(frame)))
            .boxed())
    }
}
