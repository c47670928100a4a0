use std::collections::HashSet;

use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use super::{ResolvedLink, SiteClient};

const FALLBACK_LABEL: &str = "Download";

/// A gateway button found on a detail page: the unlock page URI plus the
/// button's visible text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GatewayLink {
    pub label: String,
    pub uri: String,
}

impl SiteClient {
    /// Resolve a detail page into final download links. Phase A picks up
    /// anchors that already point at known file hosts; phase B walks gateway
    /// unlock pages. Never errors; failures only shrink the result set.
    pub(crate) async fn run_resolve(&self, detail_uri: &str) -> Vec<ResolvedLink> {
        let html = match self.fetch_page(detail_uri).await {
            Ok(html) => html,
            Err(e) => {
                warn!(detail_uri, error = %e, "detail page fetch failed");
                return Vec::new();
            }
        };

        let mut found = extract_direct_links(&html, self.direct_hosts());
        let gateways = extract_gateway_links(&html, self.gateway_hosts());
        debug!(
            detail_uri,
            direct = found.len(),
            gateways = gateways.len(),
            "detail page scanned"
        );

        // Each gateway resolves independently; one failing page only costs
        // its own entry.
        for gateway in gateways {
            match self.unlock_gateway(&gateway.uri).await {
                Ok(final_uri) => {
                    let label = finalize_label(&gateway.label, &final_uri);
                    found.push(ResolvedLink { label, uri: final_uri });
                }
                Err(e) => warn!(gateway = %gateway.uri, error = %e, "gateway unlock failed"),
            }
        }

        dedup_links(found)
    }

    /// Replay a gateway's hidden unlock form and capture the redirect target.
    /// The 3xx response is the expected success path: the unlock client
    /// never follows it, which keeps the Location header visible.
    async fn unlock_gateway(&self, gateway_uri: &str) -> anyhow::Result<String> {
        let html = self.fetch_page(gateway_uri).await?;
        let fields = extract_hidden_fields(&html);
        if fields.is_empty() {
            anyhow::bail!("no hidden unlock fields on gateway page");
        }

        let resp = self
            .unlock_client()
            .post(gateway_uri)
            .header(reqwest::header::REFERER, gateway_uri)
            .form(&fields)
            .send()
            .await?;
        let status = resp.status();
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match location {
            Some(uri) if !uri.is_empty() => Ok(uri),
            _ => anyhow::bail!("gateway replied {status} without a Location header"),
        }
    }
}

pub(crate) fn host_matches(uri: &str, allow: &[String]) -> bool {
    let Ok(url) = Url::parse(uri) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    allow.iter().any(|entry| host.contains(entry.as_str()))
}

/// Phase A: every anchor pointing at a known direct-file host, labeled with
/// its visible text.
pub(crate) fn extract_direct_links(html: &str, direct_hosts: &[String]) -> Vec<ResolvedLink> {
    let doc = Html::parse_document(html);
    let anchor_sel = Selector::parse("a[href]").expect("static selector");

    doc.select(&anchor_sel)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            if !host_matches(href, direct_hosts) {
                return None;
            }
            let text = a.text().collect::<String>().trim().to_string();
            let label = if text.is_empty() {
                FALLBACK_LABEL.to_string()
            } else {
                text
            };
            Some(ResolvedLink {
                label,
                uri: href.to_string(),
            })
        })
        .collect()
}

/// Phase B candidates: button-styled anchors pointing at known gateway hosts.
pub(crate) fn extract_gateway_links(html: &str, gateway_hosts: &[String]) -> Vec<GatewayLink> {
    let doc = Html::parse_document(html);
    let button_sel =
        Selector::parse("a[class*=\"btn\"][href], a[class*=\"button\"][href]").expect("static selector");

    doc.select(&button_sel)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            if !host_matches(href, gateway_hosts) {
                return None;
            }
            let text = a.text().collect::<String>().trim().to_string();
            let label = if text.is_empty() {
                FALLBACK_LABEL.to_string()
            } else {
                text
            };
            Some(GatewayLink {
                label,
                uri: href.to_string(),
            })
        })
        .collect()
}

/// Hidden inputs of the unlock form. Gateway pages carry the replay token
/// in a form named "landing".
pub(crate) fn extract_hidden_fields(html: &str) -> Vec<(String, String)> {
    let doc = Html::parse_document(html);
    let hidden_sel = Selector::parse(
        "form#landing input[type=\"hidden\"], form[name=\"landing\"] input[type=\"hidden\"]",
    )
    .expect("static selector");

    doc.select(&hidden_sel)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            let value = input.value().attr("value").unwrap_or("");
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn is_generic_label(label: &str) -> bool {
    let trimmed = label.trim();
    trimmed.eq_ignore_ascii_case("direct link") || trimmed.eq_ignore_ascii_case("download")
}

/// Placeholder button texts get replaced by the revealed file's name.
fn finalize_label(raw: &str, final_uri: &str) -> String {
    if is_generic_label(raw) {
        if let Some(name) = filename_from_uri(final_uri) {
            return name;
        }
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        FALLBACK_LABEL.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Last non-empty path segment of a URI, query string excluded.
pub(crate) fn filename_from_uri(uri: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

/// First-seen order wins; later entries with an already-seen URI are dropped.
pub(crate) fn dedup_links(links: Vec<ResolvedLink>) -> Vec<ResolvedLink> {
    let mut seen = HashSet::new();
    links
        .into_iter()
        .filter(|link| seen.insert(link.uri.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    const DETAIL: &str = r#"
        <html><body>
        <p><a href="https://pixeldrain.com/u/abc123">Inception.1080p.mkv</a></p>
        <p><a href="https://unrelated.example/page">Elsewhere</a></p>
        <a class="btn btn-primary" href="https://new.gdflix.dev/file/xyz">Download</a>
        <a class="button" href="https://unrelated.example/buy">Buy now</a>
        </body></html>
    "#;

    #[test]
    fn test_extract_direct_links_filters_by_host() {
        let links = extract_direct_links(DETAIL, &hosts(&["pixeldrain"]));
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].label, "Inception.1080p.mkv");
        assert_eq!(links[0].uri, "https://pixeldrain.com/u/abc123");
    }

    #[test]
    fn test_extract_direct_links_empty_anchor_gets_fallback_label() {
        let html = r#"<a href="https://pixeldrain.com/u/def"></a>"#;
        let links = extract_direct_links(html, &hosts(&["pixeldrain"]));
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].label, "Download");
    }

    #[test]
    fn test_extract_gateway_links_only_buttons() {
        let gateways = extract_gateway_links(DETAIL, &hosts(&["gdflix"]));
        assert_eq!(gateways.len(), 1);
        assert_eq!(gateways[0].uri, "https://new.gdflix.dev/file/xyz");
        assert_eq!(gateways[0].label, "Download");
    }

    #[test]
    fn test_extract_hidden_fields() {
        let html = r#"
            <form name="landing" method="post">
              <input type="hidden" name="token" value="abc">
              <input type="hidden" name="ts" value="123">
              <input type="text" name="visible" value="nope">
            </form>
        "#;
        let fields = extract_hidden_fields(html);
        assert_eq!(
            fields,
            vec![
                ("token".to_string(), "abc".to_string()),
                ("ts".to_string(), "123".to_string())
            ]
        );
    }

    #[test]
    fn test_extract_hidden_fields_ignores_other_forms() {
        let html = r#"<form name="search"><input type="hidden" name="x" value="1"></form>"#;
        assert!(extract_hidden_fields(html).is_empty());
    }

    #[test]
    fn test_generic_label_replaced_by_filename() {
        let label = finalize_label("Download", "https://cdn.example/file123.mp4?sig=xyz");
        assert_eq!(label, "file123.mp4");
        let label = finalize_label("direct link", "https://cdn.example/movie.mkv");
        assert_eq!(label, "movie.mkv");
    }

    #[test]
    fn test_specific_label_kept() {
        let label = finalize_label("Inception 1080p", "https://cdn.example/file123.mp4");
        assert_eq!(label, "Inception 1080p");
    }

    #[test]
    fn test_filename_from_uri_strips_query() {
        assert_eq!(
            filename_from_uri("https://cdn.example/a/b/file123.mp4?sig=xyz"),
            Some("file123.mp4".to_string())
        );
        assert_eq!(filename_from_uri("https://cdn.example/"), None);
        assert_eq!(filename_from_uri("not a uri"), None);
    }

    #[test]
    fn test_dedup_keeps_first_seen() {
        let links = vec![
            ResolvedLink {
                label: "first".into(),
                uri: "https://cdn.example/a".into(),
            },
            ResolvedLink {
                label: "second".into(),
                uri: "https://cdn.example/b".into(),
            },
            ResolvedLink {
                label: "dup of first".into(),
                uri: "https://cdn.example/a".into(),
            },
        ];
        let deduped = dedup_links(links);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].label, "first");
        assert_eq!(deduped[1].label, "second");
    }

    #[test]
    fn test_host_matches() {
        let allow = hosts(&["gdflix", "pixeldrain"]);
        assert!(host_matches("https://new.gdflix.dev/file/1", &allow));
        assert!(host_matches("https://PIXELDRAIN.com/u/2", &allow));
        assert!(!host_matches("https://example.com/gdflix", &allow));
        assert!(!host_matches("not a uri", &allow));
    }
}
