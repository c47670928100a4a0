use scraper::{Html, Selector};
use tracing::{debug, warn};

use super::{SearchCandidate, SiteClient};

impl SiteClient {
    /// Search the site index. Network failures, parse failures and zero
    /// matches all collapse to an empty list.
    pub(crate) async fn run_search(&self, query: &str) -> Vec<SearchCandidate> {
        let url = format!(
            "{}/?s={}&post_type=post",
            self.base_url(),
            urlencoding::encode(query)
        );
        let html = match self.fetch_page(&url).await {
            Ok(html) => html,
            Err(e) => {
                warn!(query, error = %e, "search fetch failed");
                return Vec::new();
            }
        };
        let candidates = extract_candidates(&html);
        debug!(query, results = candidates.len(), "search complete");
        candidates
    }
}

/// Pull (title, detail link) pairs out of a result listing, in document
/// order. The title prefers a thumbnail's alt text over the heading; items
/// missing either field are skipped.
pub(crate) fn extract_candidates(html: &str) -> Vec<SearchCandidate> {
    let doc = Html::parse_document(html);
    let item_sel = Selector::parse("article").expect("static selector");
    let img_sel = Selector::parse("img[alt]").expect("static selector");
    let heading_sel = Selector::parse("h1, h2, h3").expect("static selector");
    let link_sel = Selector::parse("a[href]").expect("static selector");

    let mut out = Vec::new();
    for item in doc.select(&item_sel) {
        let title = item
            .select(&img_sel)
            .filter_map(|img| img.value().attr("alt"))
            .map(str::trim)
            .find(|alt| !alt.is_empty())
            .map(str::to_string)
            .or_else(|| {
                item.select(&heading_sel)
                    .map(|h| h.text().collect::<String>().trim().to_string())
                    .find(|t| !t.is_empty())
            });
        let detail_uri = item
            .select(&link_sel)
            .filter_map(|a| a.value().attr("href"))
            .find(|href| !href.is_empty())
            .map(str::to_string);

        let (Some(title), Some(detail_uri)) = (title, detail_uri) else {
            continue;
        };
        out.push(SearchCandidate { title, detail_uri });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
        <html><body>
        <article>
          <a href="https://site.example/inception/"><img src="x.jpg" alt="Inception (2010)"></a>
          <h2>Inception Download</h2>
        </article>
        <article>
          <a href="https://site.example/tenet/"><img src="y.jpg" alt=""></a>
          <h2>Tenet (2020)</h2>
        </article>
        <article>
          <h2>No Link Here</h2>
        </article>
        </body></html>
    "#;

    #[test]
    fn test_extract_candidates_document_order() {
        let candidates = extract_candidates(LISTING);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].title, "Inception (2010)");
        assert_eq!(candidates[0].detail_uri, "https://site.example/inception/");
        // Empty alt falls back to the heading text.
        assert_eq!(candidates[1].title, "Tenet (2020)");
    }

    #[test]
    fn test_extract_candidates_skips_incomplete_items() {
        let candidates = extract_candidates("<article><h2>Title only</h2></article>");
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_extract_candidates_garbage_html() {
        assert!(extract_candidates("<<<not html").is_empty());
        assert!(extract_candidates("").is_empty());
    }
}
