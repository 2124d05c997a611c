//! Sitemap XML processing.
//!
//! A sitemap either points at more sitemaps (`sitemapindex`, or `.xml`
//! entries inside a `urlset`) or lists pages. Both become instructions for
//! the sitemap job that fetched it.

use url::Url;

use crate::error::{FrontierError, Result};
use crate::filter::is_file;

/// What a sitemap job should do with the URLs it found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SitemapInstructions {
    /// Nested sitemaps to fetch as further sitemap jobs
    pub recurse: Vec<String>,
    /// Page URLs to reserve and scrape
    pub process: Vec<String>,
}

impl SitemapInstructions {
    pub fn total(&self) -> usize {
        self.recurse.len() + self.process.len()
    }
}

fn child_locs(root: roxmltree::Node<'_, '_>, entry_tag: &str) -> Vec<String> {
    root.children()
        .filter(|n| n.is_element() && n.tag_name().name() == entry_tag)
        .filter_map(|entry| {
            entry
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "loc")
                .and_then(|loc| loc.text())
                .map(|text| text.trim().to_string())
        })
        .filter(|loc| !loc.is_empty())
        .collect()
}

/// Parse sitemap XML into recurse/process instructions.
pub fn process_sitemap(xml: &str) -> Result<SitemapInstructions> {
    let doc = roxmltree::Document::parse_with_options(
        xml,
        roxmltree::ParsingOptions {
            allow_dtd: true,
            ..Default::default()
        },
    )
    .map_err(|e| FrontierError::SitemapParse(e.to_string()))?;
    let root = doc.root_element();

    let mut instructions = SitemapInstructions::default();

    match root.tag_name().name() {
        "sitemapindex" => {
            instructions.recurse = child_locs(root, "sitemap");
        }
        "urlset" => {
            for loc in child_locs(root, "url") {
                let lower = loc.to_lowercase();
                if lower.ends_with(".xml") || lower.ends_with(".xml.gz") {
                    instructions.recurse.push(loc);
                } else if let Ok(parsed) = Url::parse(&loc) {
                    if !is_file(&parsed.path().to_lowercase()) {
                        instructions.process.push(loc);
                    }
                }
            }
        }
        other => {
            return Err(FrontierError::SitemapParse(format!(
                "root element must be 'sitemapindex' or 'urlset', got '{other}'"
            )));
        }
    }

    Ok(instructions)
}

/// Default sitemap locations for a crawl origin.
pub fn default_sitemap_urls(origin: &Url) -> Vec<String> {
    let mut base = origin.clone();
    base.set_query(None);
    base.set_fragment(None);

    ["/sitemap.xml"]
        .iter()
        .filter_map(|path| base.join(path).ok())
        .map(|u| u.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urlset_splits_pages_nested_sitemaps_and_files() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://example.com/page1</loc></url>
  <url><loc> https://example.com/page2 </loc></url>
  <url><loc>https://example.com/nested.xml</loc></url>
  <url><loc>https://example.com/logo.png</loc></url>
</urlset>"#;

        let result = process_sitemap(xml).unwrap();
        assert_eq!(
            result.process,
            vec!["https://example.com/page1", "https://example.com/page2"]
        );
        assert_eq!(result.recurse, vec!["https://example.com/nested.xml"]);
        assert_eq!(result.total(), 3);
    }

    #[test]
    fn test_sitemapindex_recurses() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>https://example.com/sitemap1.xml</loc></sitemap>
  <sitemap><loc>https://example.com/sitemap2.xml.gz</loc></sitemap>
</sitemapindex>"#;

        let result = process_sitemap(xml).unwrap();
        assert_eq!(result.recurse.len(), 2);
        assert!(result.process.is_empty());
    }

    #[test]
    fn test_invalid_root_is_rejected() {
        let xml = r#"<invalid><url><loc>https://example.com</loc></url></invalid>"#;
        let err = process_sitemap(xml).unwrap_err();
        assert!(err.to_string().contains("root element"));
    }

    #[test]
    fn test_malformed_xml_is_rejected() {
        assert!(process_sitemap("<urlset><url>").is_err());
    }

    #[test]
    fn test_default_sitemap_urls() {
        let origin = Url::parse("https://example.com/docs/start?x=1").unwrap();
        assert_eq!(
            default_sitemap_urls(&origin),
            vec!["https://example.com/sitemap.xml"]
        );
    }
}
