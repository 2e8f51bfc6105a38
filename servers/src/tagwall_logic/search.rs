//! # Search Client
//!
//! `SearchClient` over plain HTTP: `GET <search_url>?q=<query>&count=<n>`
//! through a `reqwest_middleware` client that retries transient failures with
//! exponential backoff.

use async_trait::async_trait;
use lib_tagwall::{FeedError, FeedItem, SearchClient};
use reqwest::header::AUTHORIZATION;
use reqwest::{StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::Deserialize;

/// Accepted response bodies: a bare array of items, or an object wrapping one.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchBody {
    Items(Vec<FeedItem>),
    Wrapped {
        #[serde(alias = "statuses")]
        items: Vec<FeedItem>,
    },
}

impl SearchBody {
    fn into_items(self) -> Vec<FeedItem> {
        match self {
            SearchBody::Items(items) | SearchBody::Wrapped { items } => items,
        }
    }
}

/// Whether a failed status is worth retrying later.
fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub struct HttpSearchClient {
    inner: ClientWithMiddleware,
    search_url: Url,
    auth_token: Option<String>,
}

impl HttpSearchClient {
    /// Builds a client for `search_url`, retrying transient failures up to
    /// `max_retries` times.
    pub fn new(search_url: &str, auth_token: Option<String>, max_retries: u32) -> anyhow::Result<Self> {
        let search_url = Url::parse(search_url)?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let inner = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner,
            search_url,
            auth_token,
        })
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<FeedItem>, FeedError> {
        let count = max_results.to_string();
        let mut req = self
            .inner
            .get(self.search_url.clone())
            .query(&[("q", query), ("count", count.as_str())]);
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = req.send().await.map_err(|e| FeedError::Search {
            transient: true,
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Search {
                transient: is_transient(status),
                message: format!("{}: {}", status, body),
            });
        }

        let body = response.json::<SearchBody>().await.map_err(|e| FeedError::Search {
            transient: false,
            message: e.to_string(),
        })?;
        Ok(body.into_items())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/search", addr)
    }

    #[test]
    fn status_classification() {
        assert!(is_transient(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient(StatusCode::UNAUTHORIZED));
        assert!(!is_transient(StatusCode::NOT_FOUND));
    }

    #[test]
    fn both_body_shapes_decode() {
        let bare = r#"[{"id":"1","text":"a","tags":["x"],"time":1,"author":"u"}]"#;
        let wrapped = r#"{"statuses":[{"id":"1","text":"a","tags":["x"],"time":1,"author":"u"}]}"#;
        for body in [bare, wrapped] {
            let items = serde_json::from_str::<SearchBody>(body).unwrap().into_items();
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].id, "1");
        }
    }

    #[tokio::test]
    async fn sends_query_and_count() {
        let app = Router::new().route(
            "/search",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let tag = params["q"].trim_start_matches('#').to_string();
                let body = serde_json::json!([{
                    "id": params["count"],
                    "text": params["q"],
                    "tags": [tag],
                    "time": 0,
                    "author": "echo"
                }]);
                axum::Json(body)
            }),
        );
        let url = serve(app).await;
        let client = HttpSearchClient::new(&url, None, 0).unwrap();

        let items = client.search("#launch", 25).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text, "#launch");
        assert_eq!(items[0].id, "25");
        assert_eq!(items[0].tags, vec!["launch".to_string()]);
    }

    #[tokio::test]
    async fn error_statuses_map_to_search_errors() {
        let app = Router::new().route(
            "/search",
            get(|| async { (AxumStatus::TOO_MANY_REQUESTS, "slow down").into_response() }),
        );
        let url = serve(app).await;
        let client = HttpSearchClient::new(&url, Some("secret".into()), 0).unwrap();

        match client.search("#a", 10).await {
            Err(FeedError::Search { transient, message }) => {
                assert!(transient);
                assert!(message.contains("slow down"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
