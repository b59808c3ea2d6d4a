//! Verifying artifact fetcher.
//!
//! The registry never stores distribution bytes; it fetches a publisher's
//! declared URL just long enough to verify digest and size, then discards
//! the body. HTTPS is enforced on the initial URL and on every redirect hop
//! manually, since `reqwest`'s automatic redirect handling would silently
//! follow a downgrade to plain HTTP.

use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::digest::DigestAccumulator;
use crate::error::RegistryError;

const MAX_REDIRECTS: u8 = 5;

#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    pub max_size_bytes: u64,
    pub deadline: Duration,
}

pub struct ArtifactFetcher {
    client: Client,
    limits: FetchLimits,
}

#[derive(Debug)]
pub struct FetchedArtifact {
    pub digest_hex: String,
    pub size: u64,
}

impl ArtifactFetcher {
    pub fn new(limits: FetchLimits) -> Self {
        // Redirects are followed manually so each hop can be re-checked for
        // `https`; reqwest's built-in policy doesn't expose the scheme of
        // intermediate hops.
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(limits.deadline)
            .build()
            .expect("reqwest client builds with static configuration");
        ArtifactFetcher { client, limits }
    }

    /// Fetch `url`, verifying its scheme and following redirects by hand,
    /// streaming the body through a [`DigestAccumulator`] while enforcing
    /// the size ceiling. Returns early (without reading the rest of the
    /// body) on the first violation. `cancel` lets a sibling fetch in the
    /// same publish's fan-out abort this one once any fetch has failed.
    pub async fn fetch_and_verify(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedArtifact, RegistryError> {
        require_https(url)?;
        self.head_check(url, cancel).await?;

        let mut current = url.to_string();

        for _ in 0..=MAX_REDIRECTS {
            require_https(&current)?;

            let response = tokio::select! {
                res = self.client.get(&current).send() => {
                    res.map_err(|_| RegistryError::UrlUnreachable(current.clone()))?
                }
                _ = cancel.cancelled() => {
                    return Err(RegistryError::UrlUnreachable(current.clone()));
                }
            };

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| RegistryError::UrlUnreachable(current.clone()))?;
                current = resolve_location(&current, location);
                continue;
            }

            if response.status() != StatusCode::OK {
                return Err(RegistryError::UrlUnreachable(current));
            }

            return self.drain_and_hash(&current, response, cancel).await;
        }

        Err(RegistryError::UrlRedirectLimit(url.to_string()))
    }

    /// Cheap reachability check against the registered URL before the
    /// streaming `GET`. A redirect response here is accepted as reachable;
    /// the `GET` loop below follows redirects and re-validates each hop.
    async fn head_check(&self, url: &str, cancel: &CancellationToken) -> Result<(), RegistryError> {
        let response = tokio::select! {
            res = self.client.head(url).send() => {
                res.map_err(|_| RegistryError::UrlUnreachable(url.to_string()))?
            }
            _ = cancel.cancelled() => {
                return Err(RegistryError::UrlUnreachable(url.to_string()));
            }
        };
        if !(response.status().is_success() || response.status().is_redirection()) {
            return Err(RegistryError::UrlUnreachable(url.to_string()));
        }
        Ok(())
    }

    async fn drain_and_hash(
        &self,
        url: &str,
        response: reqwest::Response,
        cancel: &CancellationToken,
    ) -> Result<FetchedArtifact, RegistryError> {
        let mut accumulator = DigestAccumulator::new();
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => {
                    return Err(RegistryError::UrlUnreachable(url.to_string()));
                }
            };

            let chunk = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(_)) => return Err(RegistryError::UrlUnreachable(url.to_string())),
                None => break,
            };

            accumulator.update(&chunk);
            if accumulator.size() > self.limits.max_size_bytes {
                cancel.cancel();
                return Err(RegistryError::SizeLimitExceeded {
                    url: url.to_string(),
                    size: accumulator.size(),
                    limit: self.limits.max_size_bytes,
                });
            }
        }

        let digest = accumulator.finish();
        Ok(FetchedArtifact { digest_hex: digest.hex, size: digest.size })
    }
}

fn require_https(url: &str) -> Result<(), RegistryError> {
    let parsed = url::Url::parse(url).map_err(|_| RegistryError::UrlUnreachable(url.to_string()))?;
    if parsed.scheme() != "https" {
        return Err(RegistryError::UrlNotHttps(url.to_string()));
    }
    Ok(())
}

fn resolve_location(base: &str, location: &str) -> String {
    match url::Url::parse(base).and_then(|b| b.join(location)) {
        Ok(joined) => joined.to_string(),
        Err(_) => {
            warn!(base, location, "failed to resolve redirect location, using it verbatim");
            location.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use wiremock::matchers::method;

    fn limits() -> FetchLimits {
        FetchLimits { max_size_bytes: 1024, deadline: Duration::from_secs(5) }
    }

    #[test]
    fn resolves_relative_redirect_against_base() {
        let resolved = resolve_location("https://example.com/a/b", "/c");
        assert_eq!(resolved, "https://example.com/c");
    }

    #[test]
    fn rejects_plain_http_scheme() {
        assert!(matches!(require_https("http://example.com/x"), Err(RegistryError::UrlNotHttps(_))));
        assert!(require_https("https://example.com/x").is_ok());
    }

    #[tokio::test]
    async fn rejects_non_https_url_without_a_network_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let fetcher = ArtifactFetcher::new(limits());
        let cancel = CancellationToken::new();
        let err = fetcher.fetch_and_verify(&server.uri(), &cancel).await.unwrap_err();
        assert!(matches!(err, RegistryError::UrlNotHttps(_)));
    }
}
