//! Board adapter contract, selector-strategy extractor, and the Kangnam board adapter.

use std::path::PathBuf;

use async_trait::async_trait;
use knb_core::{CandidateEntry, NO_DATA_PLACEHOLDER};
use knb_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "knb-adapters";

pub const KANGNAM_BOARD_ID: &str = "kangnam";

/// Current board markup: `div.tbody > ul > li` rows with the title in `dl > dt > a`.
pub const KANGNAM_PRIMARY_ITEMS: &str = "div.tbody > ul > li";
/// Older board skin.
pub const KANGNAM_SECONDARY_ITEMS: &str = ".c-board-list li";
pub const KANGNAM_ANCHORS: [&str; 2] = ["dl dt a", "a"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait BoardAdapter: Send + Sync {
    fn board_id(&self) -> &'static str;

    async fn fetch_listing(&self) -> Result<FetchedPage, AdapterError>;

    fn parse_listing(&self, page: &FetchedPage) -> Vec<CandidateEntry>;
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// One markup shape for the board: how to find rows, and where the title anchor
/// lives inside a row (anchor selectors are tried in order).
#[derive(Debug, Clone)]
pub struct SelectionStrategy {
    name: &'static str,
    items: Selector,
    anchors: Vec<Selector>,
}

impl SelectionStrategy {
    pub fn new(name: &'static str, items: &str, anchors: &[&str]) -> Result<Self, AdapterError> {
        Ok(Self {
            name,
            items: parse_selector(items)?,
            anchors: anchors
                .iter()
                .map(|a| parse_selector(a))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn select_items<'a>(&self, document: &'a Html) -> Vec<ElementRef<'a>> {
        document.select(&self.items).collect()
    }

    fn anchor_in<'a>(&self, item: ElementRef<'a>) -> Option<ElementRef<'a>> {
        self.anchors.iter().find_map(|sel| item.select(sel).next())
    }
}

/// Parses board markup into candidate entries.
///
/// Strategies are tried in order and the first one that selects any rows wins.
/// Row filtering happens afterwards, so a strategy whose rows are all filtered out
/// still wins over the ones behind it.
#[derive(Debug, Clone)]
pub struct BoardExtractor {
    strategies: Vec<SelectionStrategy>,
    base_origin: Url,
}

impl BoardExtractor {
    pub fn new(base_origin: &str, strategies: Vec<SelectionStrategy>) -> Result<Self, AdapterError> {
        let base_origin = Url::parse(base_origin).map_err(|e| {
            AdapterError::Message(format!("invalid base origin {base_origin}: {e}"))
        })?;
        Ok(Self {
            strategies,
            base_origin,
        })
    }

    pub fn kangnam(base_origin: &str) -> Result<Self, AdapterError> {
        Self::new(
            base_origin,
            vec![
                SelectionStrategy::new("tbody-list", KANGNAM_PRIMARY_ITEMS, &KANGNAM_ANCHORS)?,
                SelectionStrategy::new("c-board-list", KANGNAM_SECONDARY_ITEMS, &KANGNAM_ANCHORS)?,
            ],
        )
    }

    pub fn strategies(&self) -> &[SelectionStrategy] {
        &self.strategies
    }

    /// Fresh parse on every call; output follows document order.
    pub fn extract(&self, raw: &str) -> Vec<CandidateEntry> {
        let document = Html::parse_document(raw);

        let selected = self.strategies.iter().find_map(|strategy| {
            let items = strategy.select_items(&document);
            (!items.is_empty()).then_some((strategy, items))
        });
        let Some((strategy, items)) = selected else {
            debug!("no selection strategy matched any board rows");
            return Vec::new();
        };

        let candidates = items
            .into_iter()
            .filter_map(|item| self.candidate_from_item(strategy, item))
            .collect::<Vec<_>>();
        debug!(
            strategy = strategy.name,
            candidates = candidates.len(),
            "extracted board candidates"
        );
        candidates
    }

    fn candidate_from_item(
        &self,
        strategy: &SelectionStrategy,
        item: ElementRef<'_>,
    ) -> Option<CandidateEntry> {
        let anchor = strategy.anchor_in(item)?;
        let title = normalize_title(&anchor.text().collect::<String>());
        if title.is_empty() || title.contains(NO_DATA_PLACEHOLDER) {
            return None;
        }
        let href = anchor.value().attr("href").unwrap_or_default().trim();
        let link = self.resolve_link(href)?;
        Some(CandidateEntry { title, link })
    }

    fn resolve_link(&self, href: &str) -> Option<String> {
        match self.base_origin.join(href) {
            Ok(url) => Some(url.to_string()),
            Err(err) => {
                debug!(href, error = %err, "skipping row with unresolvable href");
                None
            }
        }
    }
}

/// Trim and collapse internal whitespace runs so the same title always
/// produces the same identity key regardless of markup indentation.
///
/// This is stricter than a plain trim: titles that differ only in inner spacing
/// (`"a  b"` vs `"a b"`) are stored once, under the single-space form.
pub fn normalize_title(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct KangnamBoardAdapter {
    http: HttpFetcher,
    board_url: String,
    extractor: BoardExtractor,
}

impl KangnamBoardAdapter {
    pub fn new(
        http: HttpFetcher,
        board_url: impl Into<String>,
        base_origin: &str,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            http,
            board_url: board_url.into(),
            extractor: BoardExtractor::kangnam(base_origin)?,
        })
    }
}

#[async_trait]
impl BoardAdapter for KangnamBoardAdapter {
    fn board_id(&self) -> &'static str {
        KANGNAM_BOARD_ID
    }

    async fn fetch_listing(&self) -> Result<FetchedPage, AdapterError> {
        let resp = self.http.fetch_text(&self.board_url).await?;
        Ok(FetchedPage {
            url: resp.final_url,
            body: resp.body,
        })
    }

    fn parse_listing(&self, page: &FetchedPage) -> Vec<CandidateEntry> {
        self.extractor.extract(&page.body)
    }
}

/// Serves a saved copy of the board page from disk instead of the network.
pub struct FixtureBoardAdapter {
    path: PathBuf,
    extractor: BoardExtractor,
}

impl FixtureBoardAdapter {
    pub fn new(path: impl Into<PathBuf>, base_origin: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            path: path.into(),
            extractor: BoardExtractor::kangnam(base_origin)?,
        })
    }
}

#[async_trait]
impl BoardAdapter for FixtureBoardAdapter {
    fn board_id(&self) -> &'static str {
        KANGNAM_BOARD_ID
    }

    async fn fetch_listing(&self) -> Result<FetchedPage, AdapterError> {
        let body = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            AdapterError::Message(format!("reading fixture {}: {e}", self.path.display()))
        })?;
        Ok(FetchedPage {
            url: self.path.display().to_string(),
            body,
        })
    }

    fn parse_listing(&self, page: &FetchedPage) -> Vec<CandidateEntry> {
        self.extractor.extract(&page.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "https://web.kangnam.ac.kr";

    fn extractor() -> BoardExtractor {
        BoardExtractor::kangnam(ORIGIN).unwrap()
    }

    #[test]
    fn kangnam_strategies_are_ordered_primary_first() {
        let names = extractor()
            .strategies()
            .iter()
            .map(SelectionStrategy::name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["tbody-list", "c-board-list"]);
    }

    #[test]
    fn invalid_selector_is_reported() {
        let err = SelectionStrategy::new("broken", "li[", &["a"]).unwrap_err();
        assert!(matches!(err, AdapterError::Selector { .. }));
    }

    #[test]
    fn invalid_base_origin_is_reported() {
        assert!(matches!(
            BoardExtractor::kangnam("not a url"),
            Err(AdapterError::Message(_))
        ));
    }

    #[test]
    fn prefers_title_anchor_over_earlier_anchor() {
        let html = r#"
            <div class="tbody"><ul>
              <li>
                <a class="file" href="/attach/1.pdf">첨부</a>
                <dl><dt><a href="/notice/1">진짜 제목</a></dt></dl>
              </li>
            </ul></div>"#;
        let out = extractor().extract(html);
        assert_eq!(
            out,
            vec![CandidateEntry::new("진짜 제목", "https://web.kangnam.ac.kr/notice/1")]
        );
    }

    #[test]
    fn falls_back_to_any_anchor_in_row() {
        let html = r#"<div class="tbody"><ul><li><span><a href="/n/2">제목 둘</a></span></li></ul></div>"#;
        let out = extractor().extract(html);
        assert_eq!(out[0].title, "제목 둘");
    }

    #[test]
    fn skips_rows_without_anchor_or_title() {
        let html = r#"
            <div class="tbody"><ul>
              <li><span>no link here</span></li>
              <li><dl><dt><a href="/n/3">   </a></dt></dl></li>
              <li><dl><dt><a href="/n/4">kept</a></dt></dl></li>
            </ul></div>"#;
        let out = extractor().extract(html);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title, "kept");
    }

    #[test]
    fn placeholder_rows_are_dropped() {
        let html = r#"<div class="tbody"><ul><li><a href="">등록된 데이터가 없습니다.</a></li></ul></div>"#;
        assert!(extractor().extract(html).is_empty());
    }

    #[test]
    fn links_resolve_against_origin() {
        let html = r#"
            <ul class="c-board-list">
              <li><a href="/menu/view.do?seq=9">absolute path</a></li>
              <li><a href="view.do?seq=10">relative path</a></li>
              <li><a href="https://portal.kangnam.ac.kr/p/11">other host</a></li>
              <li><a>missing href</a></li>
            </ul>"#;
        let links = extractor()
            .extract(html)
            .into_iter()
            .map(|c| c.link)
            .collect::<Vec<_>>();
        assert_eq!(
            links,
            vec![
                "https://web.kangnam.ac.kr/menu/view.do?seq=9",
                "https://web.kangnam.ac.kr/view.do?seq=10",
                "https://portal.kangnam.ac.kr/p/11",
                "https://web.kangnam.ac.kr/",
            ]
        );
    }

    #[test]
    fn titles_are_whitespace_normalized() {
        assert_eq!(normalize_title("\n\t [공지]\n   휴강   안내 \n"), "[공지] 휴강 안내");
        assert_eq!(normalize_title(" \n "), "");
    }

    #[test]
    fn extraction_is_repeatable() {
        let html = r#"<ul class="c-board-list"><li><a href="/a">A</a></li><li><a href="/b">B</a></li></ul>"#;
        let ex = extractor();
        assert_eq!(ex.extract(html), ex.extract(html));
    }

    #[tokio::test]
    async fn fixture_adapter_reports_missing_file() {
        let adapter = FixtureBoardAdapter::new("/definitely/not/here.html", ORIGIN).unwrap();
        let err = adapter.fetch_listing().await.unwrap_err();
        assert!(matches!(err, AdapterError::Message(_)));
    }
}
