//! Core domain model for KNB.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "knb-core";

pub const DEFAULT_BOARD_URL: &str =
    "https://web.kangnam.ac.kr/menu/f19069e6134f8f8aa7f689a4a675e66f.do";
pub const DEFAULT_BASE_ORIGIN: &str = "https://web.kangnam.ac.kr";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0";

/// Text the board renders in place of a title when the list is empty.
pub const NO_DATA_PLACEHOLDER: &str = "데이터가 없습니다";

pub const DEFAULT_RECENT_LIMIT: u32 = 30;

/// Persisted notice. `title` is the identity; `id` grows with insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub id: i64,
    pub title: String,
    pub link: String,
    pub created_at: DateTime<Utc>,
}

/// Transient (title, link) pair handed from the extractor to the ingest pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateEntry {
    pub title: String,
    pub link: String,
}

impl CandidateEntry {
    pub fn new(title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
        }
    }
}
