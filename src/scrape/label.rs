use once_cell::sync::Lazy;
use regex::Regex;

static SEASON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bs(?:eason)?\s*(\d{1,2})").expect("season pattern"));
static EPISODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)e(?:pisode)?\s*(\d{1,3})").expect("episode pattern"));
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

/// Substrings that carry no information in a link label: container
/// extensions plus the index sites' watermarks.
const NOISE_TOKENS: &[&str] = &[
    "download", "mkv", "mp4", "avi", "webm", "zip", "ssrmovies", "moviesverse", "www.", ".com",
];

const SEPARATORS: &[char] = &[
    '.', '-', '_', '|', ':', ';', ',', '[', ']', '(', ')', '{', '}', '~', '!',
];

/// Turn a raw scraped link label into something a person can pick from a
/// menu. Pure and total: the same inputs always give the same non-empty
/// string, and completely unparsable input falls back to the raw label.
///
/// `position` is the 0-based index of the link in its menu.
pub fn normalize(raw_label: &str, position: usize, parent_title: &str) -> String {
    let parent = parent_title.trim();

    if EPISODE_RE.is_match(raw_label) {
        let season = SEASON_RE
            .captures(raw_label)
            .map(|caps| caps[1].to_string());
        // The parent often already carries "Season N"; drop it so the
        // composed label doesn't say it twice.
        let stripped_parent = SEASON_RE.replace(parent, "");
        let composed = match season {
            Some(season) => format!(
                "{} [S{}] Episode {}",
                stripped_parent.trim(),
                season,
                position + 1
            ),
            None => format!("{} Episode {}", stripped_parent.trim(), position + 1),
        };
        return collapse_ws(&composed);
    }

    let cleaned = strip_noise(raw_label);
    if !cleaned.is_empty() {
        if !parent.is_empty() && cleaned.to_lowercase().contains(&parent.to_lowercase()) {
            return cleaned;
        }
        return collapse_ws(&format!("{} - {} ({})", parent, cleaned, position + 1));
    }

    let raw = raw_label.trim();
    if !raw.is_empty() {
        return raw.to_string();
    }
    if parent.is_empty() {
        return format!("Option {}", position + 1);
    }
    format!("{} ({})", parent, position + 1)
}

fn strip_noise(label: &str) -> String {
    let mut out = label.to_string();
    for token in NOISE_TOKENS {
        out = remove_ascii_ci(&out, token);
    }
    let out: String = out
        .chars()
        .map(|c| if SEPARATORS.contains(&c) { ' ' } else { c })
        .collect();
    collapse_ws(&out)
}

fn collapse_ws(s: &str) -> String {
    WS_RE.replace_all(s, " ").trim().to_string()
}

/// Remove every case-insensitive occurrence of an ASCII needle.
fn remove_ascii_ci(haystack: &str, needle: &str) -> String {
    let lower = haystack.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut at = 0;
    while let Some(pos) = lower[at..].find(&needle) {
        out.push_str(&haystack[at..at + pos]);
        at += pos + needle.len();
    }
    out.push_str(&haystack[at..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episode_with_season() {
        let label = normalize("Season 2 Episode 5 480p", 4, "Loki Season 2");
        assert_eq!(label, "Loki [S2] Episode 5");
    }

    #[test]
    fn test_episode_compact_tokens() {
        let label = normalize("S02E05.mkv", 0, "Loki");
        assert_eq!(label, "Loki [S02] Episode 1");
    }

    #[test]
    fn test_episode_without_season() {
        let label = normalize("Episode 3", 2, "Chernobyl");
        assert_eq!(label, "Chernobyl Episode 3");
    }

    #[test]
    fn test_plain_label_containing_parent_passes_through() {
        let label = normalize("Inception.1080p.mkv", 0, "Inception");
        assert_eq!(label, "Inception 1080p");
    }

    #[test]
    fn test_plain_label_without_parent_gets_prefixed() {
        let label = normalize("720p HEVC", 1, "Inception");
        assert_eq!(label, "Inception - 720p HEVC (2)");
    }

    #[test]
    fn test_download_noise_stripped() {
        let label = normalize("Download Inception 480p", 0, "Inception");
        assert_eq!(label, "Inception 480p");
    }

    #[test]
    fn test_noise_only_label_falls_back_to_raw() {
        let label = normalize("download.mkv", 0, "Inception");
        assert_eq!(label, "download.mkv");
    }

    #[test]
    fn test_odd_label_still_gets_disambiguated() {
        let label = normalize("???", 0, "Inception");
        assert_eq!(label, "Inception - ??? (1)");
    }

    #[test]
    fn test_never_empty() {
        assert_eq!(normalize("", 0, ""), "Option 1");
        assert_eq!(normalize("", 2, "Inception"), "Inception (3)");
        assert_eq!(normalize("download.mkv", 1, ""), "download.mkv");
    }

    #[test]
    fn test_pure_and_idempotent_inputs() {
        let a = normalize("S01 E02", 3, "Dark Season 1");
        let b = normalize("S01 E02", 3, "Dark Season 1");
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }
}
