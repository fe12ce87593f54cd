//! Stage 4 triage: pick the endpoints worth a closer look.

use std::collections::HashSet;

use regex::Regex;
use url::Url;

use crate::evidence::{Candidate, Endpoint};

/// Risk keywords matched case-insensitively against path and query.
pub const DEFAULT_RISK_PATTERNS: [&str; 5] = ["login", "admin", "config", "api", "php"];

/// Unmatched endpoints kept so triage never comes back empty.
pub const DEFAULT_FLOOR: usize = 3;

#[derive(Debug, Clone)]
pub struct CandidateFilter {
    patterns: Vec<(String, Regex)>,
    floor: usize,
}

impl CandidateFilter {
    pub fn new<I, S>(patterns: I, floor: usize) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Regex::new(&format!("(?i){}", regex::escape(p))).map(|re| (p.to_string(), re))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns, floor })
    }

    /// Every endpoint matching a risk pattern, plus up to `floor` unmatched
    /// ones in discovery order. URLs appear at most once.
    pub fn select(&self, endpoints: &[Endpoint]) -> Vec<Candidate> {
        let mut seen = HashSet::new();
        let mut unmatched_kept = 0;
        let mut candidates = Vec::new();

        for endpoint in endpoints {
            if !seen.insert(endpoint.url.as_str()) {
                continue;
            }
            let reason = match self.matched(&endpoint.url) {
                Some(pattern) => format!("Matched risk pattern: {}", pattern),
                None if unmatched_kept < self.floor => {
                    unmatched_kept += 1;
                    "Base target".to_string()
                }
                None => continue,
            };
            candidates.push(Candidate {
                url: endpoint.url.clone(),
                method: endpoint.method.clone(),
                reason,
            });
        }
        candidates
    }

    fn matched(&self, url: &str) -> Option<&str> {
        let haystack = match Url::parse(url) {
            Ok(parsed) => match parsed.query() {
                Some(query) => format!("{}?{}", parsed.path(), query),
                None => parsed.path().to_string(),
            },
            Err(_) => url.to_string(),
        };
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(&haystack))
            .map(|(name, _)| name.as_str())
    }
}

impl Default for CandidateFilter {
    fn default() -> Self {
        let patterns = DEFAULT_RISK_PATTERNS
            .iter()
            .map(|p| (p.to_string(), Regex::new(&format!("(?i){}", p))))
            .filter_map(|(p, re)| re.ok().map(|re| (p, re)))
            .collect();
        Self {
            patterns,
            floor: DEFAULT_FLOOR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EndpointSource;

    fn endpoint(url: &str) -> Endpoint {
        Endpoint {
            url: url.to_string(),
            method: "GET".to_string(),
            source: EndpointSource::Crawl,
        }
    }

    #[test]
    fn test_risky_path_is_always_kept() {
        let endpoints: Vec<Endpoint> = (0..10)
            .map(|i| endpoint(&format!("http://10.0.0.1/page{}", i)))
            .chain(std::iter::once(endpoint("http://10.0.0.1/admin/login.php")))
            .collect();

        let candidates = CandidateFilter::default().select(&endpoints);
        let risky = candidates
            .iter()
            .find(|c| c.url.ends_with("/admin/login.php"))
            .unwrap();
        assert!(risky.reason.starts_with("Matched risk pattern: "));
        assert_eq!(candidates.len(), 1 + DEFAULT_FLOOR);
    }

    #[test]
    fn test_floor_keeps_unmatched_endpoints() {
        let endpoints = vec![endpoint("http://a/"), endpoint("http://a/about")];
        let candidates = CandidateFilter::default().select(&endpoints);
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.reason == "Base target"));
    }

    #[test]
    fn test_host_is_not_matched() {
        // "api" in the host name alone is not a risky path
        let endpoints = vec![endpoint("http://api.example.com/index.html")];
        let filter = CandidateFilter::new(["api"], 0).unwrap();
        assert!(filter.select(&endpoints).is_empty());

        let endpoints = vec![endpoint("http://example.com/v1/API/users")];
        assert_eq!(filter.select(&endpoints).len(), 1);
    }

    #[test]
    fn test_query_is_matched_and_urls_deduped() {
        let endpoints = vec![
            endpoint("http://a/index?page=config"),
            endpoint("http://a/index?page=config"),
        ];
        let candidates = CandidateFilter::default().select(&endpoints);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].reason, "Matched risk pattern: config");
    }

    #[test]
    fn test_empty_input_yields_empty_selection() {
        assert!(CandidateFilter::default().select(&[]).is_empty());
    }
}
