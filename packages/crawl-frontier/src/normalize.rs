//! URL canonicalization and surface-equivalent permutations.
//!
//! Two jobs that resolve to the same page under different spellings
//! (`http` vs `https`, `www.` prefix, trailing slash, `index.html`) must never
//! both be scheduled, so every permutation is reserved together.

use std::collections::BTreeSet;

use url::Url;

use crate::error::{FrontierError, Result};
use crate::types::{CrawlState, LockRequest};

/// Canonical form of `url` under the crawl's normalization policy.
///
/// Fragments are always dropped; the query string is dropped when the crawl
/// ignores query parameters.
pub fn normalize_url(url: &str, crawl: &CrawlState) -> Result<String> {
    let mut parsed = Url::parse(url).map_err(|_| FrontierError::invalid_url(url))?;
    if parsed.host_str().is_none() {
        return Err(FrontierError::invalid_url(url));
    }

    parsed.set_fragment(None);
    if crawl.crawler_options.ignore_query_parameters {
        parsed.set_query(None);
    }

    Ok(parsed.to_string())
}

/// Every surface-equivalent spelling of `url`, including `url` itself.
///
/// Output is deduplicated and sorted so the same page always yields the
/// same key set.
pub fn generate_url_permutations(url: &Url) -> Vec<Url> {
    let mut hosts = Vec::with_capacity(2);
    let mut with_www = url.clone();
    let mut without_www = url.clone();
    if let Some(host) = url.host_str() {
        match host.strip_prefix("www.") {
            Some(bare) => {
                let _ = without_www.set_host(Some(bare));
            }
            None => {
                let _ = with_www.set_host(Some(&format!("www.{host}")));
            }
        }
    }
    hosts.push(with_www);
    hosts.push(without_www);

    let schemes: Vec<Url> = hosts
        .into_iter()
        .flat_map(|u| {
            if u.scheme() != "http" && u.scheme() != "https" {
                return vec![u];
            }
            let mut http = u.clone();
            let mut https = u;
            let _ = http.set_scheme("http");
            let _ = https.set_scheme("https");
            vec![http, https]
        })
        .collect();

    let mut seen = BTreeSet::new();
    for u in schemes {
        for variant in path_variants(&u) {
            seen.insert(variant.to_string());
        }
    }

    seen.into_iter().filter_map(|s| Url::parse(&s).ok()).collect()
}

fn path_variants(url: &Url) -> Vec<Url> {
    let path = url.path().to_string();

    let base = if path.ends_with("/index.html") {
        path.trim_end_matches("index.html").to_string()
    } else if path.ends_with("/index.php") {
        path.trim_end_matches("index.php").to_string()
    } else if path.ends_with('/') {
        path.clone()
    } else {
        format!("{path}/")
    };

    let bare = if base.len() > 1 {
        base.trim_end_matches('/').to_string()
    } else {
        base.clone()
    };

    [
        base.clone(),
        bare,
        format!("{base}index.html"),
        format!("{base}index.php"),
    ]
    .into_iter()
    .map(|p| {
        let mut variant = url.clone();
        variant.set_path(&p);
        variant
    })
    .collect()
}

/// Builds the reservation keys for `url` under the crawl's dedup policy.
pub fn lock_request(url: &str, crawl: &CrawlState) -> Result<LockRequest> {
    let unique_key = normalize_url(url, crawl)?;

    let permutation_keys = if crawl.crawler_options.deduplicate_similar_urls {
        let parsed = Url::parse(&unique_key).map_err(|_| FrontierError::invalid_url(url))?;
        generate_url_permutations(&parsed)
            .into_iter()
            .map(|u| u.to_string())
            .collect()
    } else {
        vec![unique_key.clone()]
    };

    Ok(LockRequest {
        unique_key,
        permutation_keys,
    })
}
