//! Reader mode: strip page chrome and keep the main article.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

/// Elements that never hold article prose.
const CLUTTER_TAGS: &[&str] = &[
    "script", "style", "noscript", "svg", "iframe", "nav", "header", "footer", "aside", "form",
    "button",
];

/// Candidate containers, most specific first.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "main",
    "[role='main']",
    ".entry-content",
    ".article-body",
    ".post",
    "#content",
    ".content",
];

const MIN_CONTENT_CHARS: usize = 100;

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static CLUTTER_RE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    CLUTTER_TAGS
        .iter()
        .map(|tag| Regex::new(&format!(r"(?is)<{0}\b[^>]*>.*?</{0}>|<{0}\b[^>]*/?>", tag)).unwrap())
        .collect()
});

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadableArticle {
    pub title: Option<String>,
    pub html: String,
    pub text: String,
}

impl ReadableArticle {
    /// `<h1>title</h1>` followed by the cleaned article.
    pub fn to_html(&self) -> String {
        match &self.title {
            Some(t) => format!("<h1>{}</h1>{}", escape_html(t), self.html),
            None => self.html.clone(),
        }
    }
}

pub fn extract_readable(html: &str) -> ReadableArticle {
    let doc = Html::parse_document(html);
    let title = extract_title(&doc);

    let cleaned = strip_clutter(html);
    let doc = Html::parse_document(&cleaned);

    let main = CONTENT_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|sel| {
            doc.select(&sel)
                .max_by_key(|e| text_of(e).len())
                .filter(|e| text_of(e).len() >= MIN_CONTENT_CHARS)
        })
        .or_else(|| {
            let body = Selector::parse("body").ok()?;
            doc.select(&body).next()
        });

    match main {
        Some(e) => ReadableArticle {
            title,
            html: e.inner_html().trim().to_string(),
            text: text_of(&e),
        },
        None => ReadableArticle {
            title,
            ..Default::default()
        },
    }
}

fn extract_title(doc: &Html) -> Option<String> {
    let candidates = [
        ("meta[property='og:title']", true),
        ("title", false),
        ("h1", false),
    ];
    candidates.iter().find_map(|(sel, is_meta)| {
        let sel = Selector::parse(sel).ok()?;
        let el = doc.select(&sel).next()?;
        let raw = if *is_meta {
            el.value().attr("content")?.to_string()
        } else {
            el.text().collect::<String>()
        };
        let t = collapse_whitespace(&raw);
        (!t.is_empty()).then_some(t)
    })
}

pub fn strip_clutter(html: &str) -> String {
    CLUTTER_RE
        .iter()
        .fold(html.to_string(), |acc, re| re.replace_all(&acc, "").into_owned())
}

fn text_of(e: &ElementRef) -> String {
    collapse_whitespace(&e.text().collect::<Vec<_>>().join(" "))
}

fn collapse_whitespace(s: &str) -> String {
    WS_RE.replace_all(s, " ").trim().to_string()
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
