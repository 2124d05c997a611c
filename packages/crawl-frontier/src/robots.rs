//! Robots.txt rules for the crawler's user agent.
//!
//! Matching follows the robots exclusion protocol as implemented by
//! `texting_robots`: `*` wildcards, `$` anchors, longest match wins.

use texting_robots::Robot;
use url::Url;

/// User-agent token matched against robots.txt groups.
pub const CRAWLER_USER_AGENT: &str = "crawlbot";

/// Parsed robots.txt rules for one user agent.
///
/// A file that fails to parse blocks nothing and lists no sitemaps.
pub struct RobotsTxt {
    robot: Option<Robot>,
}

impl RobotsTxt {
    /// Parse `content` for [`CRAWLER_USER_AGENT`].
    pub fn parse(content: &str) -> Self {
        Self::for_agent(CRAWLER_USER_AGENT, content)
    }

    pub fn for_agent(user_agent: &str, content: &str) -> Self {
        let robot = match Robot::new(user_agent, content.as_bytes()) {
            Ok(robot) => Some(robot),
            Err(e) => {
                tracing::debug!(error = %e, "unparseable robots.txt ignored");
                None
            }
        };
        Self { robot }
    }

    /// Check a full URL (path plus query) against the rules.
    pub fn is_url_allowed(&self, url: &Url) -> bool {
        self.robot
            .as_ref()
            .map_or(true, |robot| robot.allowed(url.as_str()))
    }

    /// Sitemaps listed in the file.
    pub fn sitemaps(&self) -> &[String] {
        self.robot
            .as_ref()
            .map_or(&[], |robot| robot.sitemaps.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse("https://example.com").unwrap().join(path).unwrap()
    }

    #[test]
    fn test_parse_basic() {
        let content = r#"
User-agent: *
Disallow: /private/
Disallow: /admin/
Allow: /public/

Sitemap: https://example.com/sitemap.xml
        "#;

        let robots = RobotsTxt::for_agent("TestBot", content);

        assert!(robots.is_url_allowed(&url("/public/page")));
        assert!(!robots.is_url_allowed(&url("/private/page")));
        assert!(!robots.is_url_allowed(&url("/admin/")));
        assert!(robots.is_url_allowed(&url("/other/page")));
        assert_eq!(robots.sitemaps(), &["https://example.com/sitemap.xml".to_string()]);
    }

    #[test]
    fn test_specific_user_agent() {
        let content = r#"
User-agent: *
Disallow: /

User-agent: crawlbot
Disallow:
        "#;

        assert!(!RobotsTxt::for_agent("BadBot", content).is_url_allowed(&url("/page")));
        assert!(RobotsTxt::parse(content).is_url_allowed(&url("/page")));
    }

    #[test]
    fn test_consecutive_user_agents_share_group() {
        let content = r#"
User-agent: alpha
User-agent: beta
Disallow: /secret
        "#;

        assert!(!RobotsTxt::for_agent("alpha", content).is_url_allowed(&url("/secret/x")));
        assert!(!RobotsTxt::for_agent("beta", content).is_url_allowed(&url("/secret/x")));
        assert!(RobotsTxt::for_agent("gamma", content).is_url_allowed(&url("/secret/x")));
    }

    #[test]
    fn test_longest_match_wins() {
        let content = r#"
User-agent: *
Disallow: /private/
Allow: /private/public/
        "#;

        let robots = RobotsTxt::parse(content);

        assert!(!robots.is_url_allowed(&url("/private/secret")));
        assert!(robots.is_url_allowed(&url("/private/public/page")));
    }

    #[test]
    fn test_wildcard_and_end_anchor_patterns() {
        let content = r#"
User-agent: *
Disallow: /*.pdf$
Disallow: /*?sessionid=
        "#;

        let robots = RobotsTxt::parse(content);

        assert!(!robots.is_url_allowed(&url("/files/report.pdf")));
        assert!(robots.is_url_allowed(&url("/files/report.pdf.html")));
        assert!(!robots.is_url_allowed(&url("/shop/cart?sessionid=42")));
        assert!(robots.is_url_allowed(&url("/shop/cart")));
    }

    #[test]
    fn test_query_is_part_of_match() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: /search?q=");

        assert!(!robots.is_url_allowed(&url("/search?q=rust")));
        assert!(robots.is_url_allowed(&url("/search")));
    }

    #[test]
    fn test_empty_robots() {
        let robots = RobotsTxt::parse("");

        assert!(robots.is_url_allowed(&url("/any/path")));
        assert!(robots.sitemaps().is_empty());
    }
}
