//! HTTP gallery listing adapter.
//!
//! Speaks a minimal JSON paging protocol:
//! `GET {base}/galleries/{source_id}/items[?cursor=...]` returning
//! `{"items": [{"id", "url", "size"?}], "next_cursor"?}`. Anything more
//! site-specific belongs in another adapter behind [`ItemSource`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::{ItemDescriptor, ItemSource, ListingError, ListingPage};

/// Connect timeout for listing requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read timeout for listing requests; pages are small.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Wire format of a listing page.
#[derive(Debug, Deserialize)]
struct PagePayload {
    items: Vec<PageItem>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Wire format of one listed item.
#[derive(Debug, Deserialize)]
struct PageItem {
    id: String,
    url: String,
    #[serde(default)]
    size: Option<u64>,
}

/// [`ItemSource`] over a JSON gallery listing endpoint.
#[derive(Debug, Clone)]
pub struct HttpGallerySource {
    client: reqwest::Client,
    listing_url: Url,
    source_id: String,
}

impl HttpGallerySource {
    /// Creates a source for `source_id` hosted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ListingError::InvalidSource`] if the base URL and source
    /// identifier do not combine into a valid listing URL.
    pub fn new(base_url: &str, source_id: &str) -> Result<Self, ListingError> {
        let invalid = || ListingError::InvalidSource {
            source_id: source_id.to_string(),
        };

        let mut listing_url = Url::parse(base_url).map_err(|_| invalid())?;
        // Appended as a segment so separators in a hostile source id are
        // percent-encoded instead of reshaping the request path
        listing_url
            .path_segments_mut()
            .map_err(|()| invalid())?
            .pop_if_empty()
            .extend(["galleries", source_id, "items"]);

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .gzip(true)
            .user_agent(crate::fetch::default_user_agent())
            .build()
            .map_err(|source| ListingError::Network {
                url: listing_url.to_string(),
                source,
            })?;

        Ok(Self {
            client,
            listing_url,
            source_id: source_id.to_string(),
        })
    }

    fn page_url(&self, cursor: Option<&str>) -> Url {
        let mut url = self.listing_url.clone();
        if let Some(cursor) = cursor {
            url.query_pairs_mut().append_pair("cursor", cursor);
        }
        url
    }
}

#[async_trait]
impl ItemSource for HttpGallerySource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn next_page(&self, cursor: Option<&str>) -> Result<ListingPage, ListingError> {
        let url = self.page_url(cursor);

        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                ListingError::Timeout {
                    url: url.to_string(),
                }
            } else {
                ListingError::Network {
                    url: url.to_string(),
                    source: e,
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ListingError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ListingError::Timeout {
                    url: url.to_string(),
                }
            } else {
                ListingError::Network {
                    url: url.to_string(),
                    source: e,
                }
            }
        })?;

        let payload: PagePayload =
            serde_json::from_slice(&body).map_err(|source| ListingError::Decode {
                url: url.to_string(),
                source,
            })?;

        Ok(ListingPage {
            items: payload
                .items
                .into_iter()
                .map(|item| ItemDescriptor {
                    identifier: item.id,
                    remote_url: item.url,
                    expected_size: item.size,
                })
                .collect(),
            next_cursor: payload.next_cursor,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn page_body(ids: &[&str], next: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "items": ids.iter().map(|id| serde_json::json!({
                "id": id,
                "url": format!("https://cdn.example/i/{id}.jpg"),
                "size": 1024,
            })).collect::<Vec<_>>(),
            "next_cursor": next,
        })
    }

    #[tokio::test]
    async fn test_first_page_has_no_cursor_param() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/galleries/cats/items"))
            .and(query_param_is_missing("cursor"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["a"], Some("p2"))))
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpGallerySource::new(&server.uri(), "cats").unwrap();
        let page = source.next_page(None).await.unwrap();

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].identifier, "a");
        assert_eq!(page.items[0].expected_size, Some(1024));
        assert_eq!(page.next_cursor.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn test_cursor_is_passed_as_query_param() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/galleries/cats/items"))
            .and(query_param("cursor", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["b"], None)))
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpGallerySource::new(&server.uri(), "cats").unwrap();
        let page = source.next_page(Some("p2")).await.unwrap();

        assert_eq!(page.items[0].identifier, "b");
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_error_status_maps_to_http_status() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/galleries/gone/items"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = HttpGallerySource::new(&server.uri(), "gone").unwrap();
        let result = source.next_page(None).await;

        match result {
            Err(ListingError::HttpStatus { status: 404, .. }) => {}
            other => panic!("Expected HttpStatus 404, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_maps_to_decode_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/galleries/cats/items"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let source = HttpGallerySource::new(&server.uri(), "cats").unwrap();
        let result = source.next_page(None).await;

        assert!(matches!(result, Err(ListingError::Decode { .. })));
    }

    #[tokio::test]
    async fn test_missing_next_cursor_defaults_to_none() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/galleries/cats/items"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "items": [{"id": "x", "url": "https://cdn.example/i/x.jpg"}],
                })),
            )
            .mount(&server)
            .await;

        let source = HttpGallerySource::new(&server.uri(), "cats").unwrap();
        let page = source.next_page(None).await.unwrap();

        assert!(page.next_cursor.is_none());
        assert!(page.items[0].expected_size.is_none());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let result = HttpGallerySource::new("not a url", "cats");
        assert!(matches!(result, Err(ListingError::InvalidSource { .. })));
    }

    #[test]
    fn test_source_id_separators_are_escaped() {
        let source = HttpGallerySource::new("https://api.example.com", "a/b?c").unwrap();
        assert_eq!(source.listing_url.path(), "/galleries/a%2Fb%3Fc/items");
    }

    #[test]
    fn test_base_url_trailing_slash_and_subpath() {
        let source = HttpGallerySource::new("https://api.example.com/v2/", "cats").unwrap();
        assert_eq!(source.listing_url.path(), "/v2/galleries/cats/items");
    }

    #[tokio::test]
    async fn test_hostile_source_id_cannot_reshape_request_path() {
        let server = MockServer::start().await;

        // The unescaped path must never be requested
        Mock::given(method("GET"))
            .and(path("/galleries/cats/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["a"], None)))
            .expect(0)
            .mount(&server)
            .await;

        let source = HttpGallerySource::new(&server.uri(), "cats/items?x=1#frag").unwrap();
        // The escaped path has no mock mounted, so this 404s rather than
        // silently listing another gallery
        let result = source.next_page(None).await;
        assert!(matches!(result, Err(ListingError::HttpStatus { status: 404, .. })));
    }
}
