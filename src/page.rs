//! Browser capability boundary.
//!
//! The engine never talks to an automation driver directly; it sees the
//! rendered page through these traits. `webdriver.rs` implements them over
//! the wire protocol, tests implement them over in-memory fixtures.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PageError {
    #[error("driver transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("driver protocol: {0}")]
    Protocol(String),
}

pub type PageResult<T> = std::result::Result<T, PageError>;

/// Element lookup strategies the engine needs. Kept deliberately small;
/// anything fancier belongs in a CSS selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Id(String),
    Css(String),
    PartialLinkText(String),
    Tag(String),
}

impl Locator {
    pub fn id(value: &str) -> Self {
        Locator::Id(value.to_string())
    }

    pub fn css(value: &str) -> Self {
        Locator::Css(value.to_string())
    }

    pub fn partial_link_text(value: &str) -> Self {
        Locator::PartialLinkText(value.to_string())
    }

    pub fn tag(value: &str) -> Self {
        Locator::Tag(value.to_string())
    }
}

/// One located element on the page.
#[async_trait]
pub trait Element: Send + Sync {
    async fn text(&self) -> PageResult<String>;
    async fn attr(&self, name: &str) -> PageResult<Option<String>>;
    async fn click(&self) -> PageResult<()>;
    async fn clear(&self) -> PageResult<()>;
    async fn type_text(&self, text: &str) -> PageResult<()>;
    async fn is_displayed(&self) -> PageResult<bool>;
    async fn scroll_into_view(&self) -> PageResult<()>;
    async fn find_all(&self, locator: &Locator) -> PageResult<Vec<Box<dyn Element>>>;
}

/// The browser session as the engine sees it.
#[async_trait]
pub trait Page: Send + Sync {
    async fn goto(&self, url: &str) -> PageResult<()>;
    async fn find_all(&self, locator: &Locator) -> PageResult<Vec<Box<dyn Element>>>;
    /// Send ESC to the document body (dismisses overlays).
    async fn press_escape(&self) -> PageResult<()>;
    /// Current session cookies, rendered as a `Cookie:` header value.
    async fn cookie_header(&self) -> PageResult<String>;
    async fn user_agent(&self) -> PageResult<String>;
    async fn window_handles(&self) -> PageResult<Vec<String>>;
    async fn current_window(&self) -> PageResult<String>;
    async fn switch_to_window(&self, handle: &str) -> PageResult<()>;
    /// Release the underlying browser session.
    async fn close(&self) -> PageResult<()>;
}
