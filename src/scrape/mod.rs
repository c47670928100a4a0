pub mod label;
mod links;
mod search;

pub(crate) use links::filename_from_uri;

use async_trait::async_trait;
use reqwest::redirect::Policy;

use crate::config::{Config, BROWSER_USER_AGENT};

/// One search hit: a human-readable title and the detail page behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCandidate {
    pub title: String,
    pub detail_uri: String,
}

/// A final, directly fetchable download location with its display label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLink {
    pub label: String,
    pub uri: String,
}

/// What the dialogue controller needs from the scraping layer. Both calls
/// collapse every failure mode to an empty list, so "nothing found" is the
/// only outcome the caller has to handle.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn search(&self, query: &str) -> Vec<SearchCandidate>;
    async fn resolve_links(&self, detail_uri: &str) -> Vec<ResolvedLink>;
}

pub struct SiteClient {
    /// Follows redirects; used for the search index, detail and gateway pages.
    pages: reqwest::Client,
    /// Never follows redirects, so a gateway POST's Location header stays
    /// observable on the 3xx response.
    unlock: reqwest::Client,
    base_url: String,
    direct_hosts: Vec<String>,
    gateway_hosts: Vec<String>,
}

impl SiteClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        // The scraped hosts routinely present broken certificate chains.
        let pages = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .user_agent(BROWSER_USER_AGENT)
            .timeout(config.http_timeout)
            .build()?;
        let unlock = reqwest::Client::builder()
            .redirect(Policy::none())
            .danger_accept_invalid_certs(true)
            .user_agent(BROWSER_USER_AGENT)
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            pages,
            unlock,
            base_url: config.site_base_url.trim_end_matches('/').to_string(),
            direct_hosts: config.direct_hosts.clone(),
            gateway_hosts: config.gateway_hosts.clone(),
        })
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn unlock_client(&self) -> &reqwest::Client {
        &self.unlock
    }

    pub(crate) fn direct_hosts(&self) -> &[String] {
        &self.direct_hosts
    }

    pub(crate) fn gateway_hosts(&self) -> &[String] {
        &self.gateway_hosts
    }

    pub(crate) async fn fetch_page(&self, url: &str) -> Result<String, reqwest::Error> {
        self.pages.get(url).send().await?.error_for_status()?.text().await
    }
}

#[async_trait]
impl ContentResolver for SiteClient {
    async fn search(&self, query: &str) -> Vec<SearchCandidate> {
        self.run_search(query).await
    }

    async fn resolve_links(&self, detail_uri: &str) -> Vec<ResolvedLink> {
        self.run_resolve(detail_uri).await
    }
}
