use std::time::Duration;

use url::Url;

use crate::browser::BrowserProfile;

const DESKTOP_CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Link selectors that work on most news listings.
pub const GENERIC_SELECTORS: &[&str] = &[
    "a[href*='/article']",
    "a[href*='/story/']",
    "a[href*='/weird']",
    "a[href*='/Odd_News']",
    "a[href*='/offbeat']",
    "h3 a",
    "article a",
];

/// Best-effort page preparation after the page is ready.
#[derive(Debug, Clone, PartialEq)]
pub enum PrepStep {
    WaitForSelector { selector: String, timeout: Duration },
    ScrollToBottom { settle: Duration },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteProfile {
    pub selectors: Vec<String>,
    pub prepare: Vec<PrepStep>,
    pub browser: BrowserProfile,
}

struct SiteEntry {
    domain: &'static str,
    selectors: &'static [&'static str],
    build: fn(&mut SiteProfile),
}

const SITES: &[SiteEntry] = &[
    SiteEntry {
        domain: "apnews.com",
        selectors: &["a[href^='https://apnews.com/article/']"],
        build: |_| {},
    },
    SiteEntry {
        domain: "news.sky.com",
        selectors: &["a.sdc-site-tile__headline-link"],
        // lazy-loaded tiles
        build: |p| {
            p.prepare.push(PrepStep::ScrollToBottom {
                settle: Duration::from_millis(1500),
            })
        },
    },
    SiteEntry {
        domain: "npr.org",
        selectors: &["h2.title a"],
        build: |p| {
            p.prepare.push(PrepStep::WaitForSelector {
                selector: "h2.title a".into(),
                timeout: Duration::from_secs(5),
            })
        },
    },
    SiteEntry {
        domain: "upi.com",
        selectors: &["a[href*='/Odd_News/']"],
        // blocks headless user agents
        build: |p| {
            p.browser = BrowserProfile {
                user_agent: Some(DESKTOP_CHROME_UA.into()),
                viewport: Some((1280, 900)),
                locale: Some("en-US".into()),
                timezone: Some("America/New_York".into()),
            }
        },
    },
    SiteEntry {
        domain: "nypost.com",
        selectors: &["a[href*='/weird-but-true/']"],
        build: |_| {},
    },
    SiteEntry {
        domain: "huffpost.com",
        selectors: &["a[href*='/entry/']", "a[href*='/weird-news/']"],
        build: |_| {},
    },
    SiteEntry {
        domain: "scmp.com",
        selectors: &["a[href*='/offbeat/']"],
        build: |_| {},
    },
];

/// Host `h` belongs to `domain` when equal or a subdomain of it.
fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Per-site settings for a target URL; unknown sites get an empty profile.
pub fn profile_for(locator: &str) -> SiteProfile {
    let Some(host) = Url::parse(locator)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    else {
        return SiteProfile::default();
    };

    let mut profile = SiteProfile::default();
    if let Some(entry) = SITES.iter().find(|s| host_matches(&host, s.domain)) {
        profile.selectors = entry.selectors.iter().map(|s| s.to_string()).collect();
        (entry.build)(&mut profile);
    }
    profile
}

/// Site selectors first, then the caller's, then the generic fallbacks; no duplicates.
pub fn link_selectors(site: &SiteProfile, requested: &[String], site_defaults: bool) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let site_sel: &[String] = if site_defaults { &site.selectors } else { &[] };
    let generic: Vec<String> = if site_defaults || requested.is_empty() {
        GENERIC_SELECTORS.iter().map(|s| s.to_string()).collect()
    } else {
        Vec::new()
    };
    for sel in site_sel.iter().chain(requested).chain(generic.iter()) {
        if !out.contains(sel) {
            out.push(sel.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_subdomains_but_not_lookalikes() {
        assert!(host_matches("www.npr.org", "npr.org"));
        assert!(host_matches("npr.org", "npr.org"));
        assert!(!host_matches("notnpr.org", "npr.org"));
        assert!(!host_matches("sky.com", "news.sky.com"));
    }

    #[test]
    fn npr_waits_for_titles() {
        let p = profile_for("https://www.npr.org/sections/strange-news/");
        assert_eq!(p.selectors, vec!["h2.title a"]);
        assert!(matches!(
            p.prepare.as_slice(),
            [PrepStep::WaitForSelector { selector, .. }] if selector == "h2.title a"
        ));
    }

    #[test]
    fn upi_spoofs_desktop_browser() {
        let p = profile_for("https://www.upi.com/Odd_News/");
        assert!(p.browser.user_agent.as_deref().unwrap().contains("Chrome/120"));
        assert_eq!(p.browser.viewport, Some((1280, 900)));
        assert_eq!(p.browser.timezone.as_deref(), Some("America/New_York"));
    }

    #[test]
    fn sky_scrolls_for_lazy_tiles() {
        let p = profile_for("https://news.sky.com/strange-news");
        assert!(matches!(p.prepare.as_slice(), [PrepStep::ScrollToBottom { .. }]));
    }

    #[test]
    fn unknown_site_gets_generic_selectors_only() {
        let p = profile_for("https://example.org/news");
        assert_eq!(p, SiteProfile::default());
        let sels = link_selectors(&p, &[], true);
        assert_eq!(sels.len(), GENERIC_SELECTORS.len());
        assert_eq!(sels[0], "a[href*='/article']");
    }

    #[test]
    fn selector_order_is_site_then_requested_then_generic() {
        let p = profile_for("https://www.huffpost.com/news/weird-news");
        let sels = link_selectors(&p, &["h3 a".to_string(), ".teaser a".to_string()], true);
        assert_eq!(&sels[..4], &[
            "a[href*='/entry/']",
            "a[href*='/weird-news/']",
            "h3 a",
            ".teaser a",
        ]);
        // "h3 a" appears once even though it is also generic
        assert_eq!(sels.iter().filter(|s| *s == "h3 a").count(), 1);
    }

    #[test]
    fn explicit_selectors_without_defaults() {
        let p = profile_for("https://apnews.com/hub/oddities");
        let sels = link_selectors(&p, &[".story a".to_string()], false);
        assert_eq!(sels, vec![".story a"]);
    }
}
