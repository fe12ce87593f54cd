//! Stage 3 fallback when crawling finds nothing.

use std::collections::HashSet;

use url::Url;

use crate::evidence::{Endpoint, EndpointSource, Fingerprint};

/// Endpoints derived from fingerprints alone: every fingerprinted URL and
/// every redirect target, resolved against the URL that issued it.
pub fn fallback_endpoints(fingerprints: &[Fingerprint]) -> Vec<Endpoint> {
    let mut seen = HashSet::new();
    let mut endpoints = Vec::new();
    let mut push = |url: String, source: EndpointSource| {
        if !url.is_empty() && seen.insert(url.clone()) {
            endpoints.push(Endpoint {
                url,
                method: "GET".to_string(),
                source,
            });
        }
    };

    for fp in fingerprints {
        push(fp.url.clone(), EndpointSource::Fingerprint);

        let Some(location) = fp.location.as_deref().map(str::trim).filter(|l| !l.is_empty()) else {
            continue;
        };
        let resolved = match Url::parse(&fp.url).and_then(|base| base.join(location)) {
            Ok(url) => url.to_string(),
            Err(_) if location.starts_with("http://") || location.starts_with("https://") => {
                location.to_string()
            }
            Err(_) => continue,
        };
        push(resolved, EndpointSource::Redirect);
    }
    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(url: &str, location: Option<&str>) -> Fingerprint {
        Fingerprint {
            url: url.to_string(),
            location: location.map(String::from),
            ..Fingerprint::default()
        }
    }

    #[test]
    fn test_fallback_includes_redirect_targets() {
        let endpoints = fallback_endpoints(&[
            fp("http://10.0.0.1:8080", Some("/login.php")),
            fp("https://10.0.0.1", Some("https://sso.example.com/auth")),
        ]);
        let urls: Vec<&str> = endpoints.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "http://10.0.0.1:8080",
                "http://10.0.0.1:8080/login.php",
                "https://10.0.0.1",
                "https://sso.example.com/auth",
            ]
        );
        assert_eq!(endpoints[1].source, EndpointSource::Redirect);
    }

    #[test]
    fn test_fallback_is_non_empty_with_any_url() {
        let endpoints = fallback_endpoints(&[fp("http://a", None)]);
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].source, EndpointSource::Fingerprint);
    }

    #[test]
    fn test_fallback_dedupes() {
        let endpoints = fallback_endpoints(&[
            fp("http://a/", Some("/")),
            fp("http://a/", None),
        ]);
        assert_eq!(endpoints.len(), 1);
    }
}
