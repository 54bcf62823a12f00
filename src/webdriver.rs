//! W3C WebDriver adapter for the page capability traits.
//!
//! Talks plain JSON-over-HTTP to a chromedriver endpoint. Only the handful
//! of commands the engine needs are implemented.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::page::{Element, Locator, Page, PageError, PageResult};

/// Key under which the protocol nests element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const ESCAPE_KEY: &str = "\u{e00c}";

#[derive(Deserialize)]
struct WdValue<T> {
    value: T,
}

#[derive(Deserialize)]
struct NewSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Deserialize)]
struct WdCookie {
    name: String,
    value: String,
}

struct Driver {
    http: reqwest::Client,
    base: String,
    session: String,
}

impl Driver {
    fn url(&self, command: &str) -> String {
        format!("{}/session/{}/{}", self.base, self.session, command)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, command: &str) -> PageResult<T> {
        let resp = self.http.get(self.url(command)).send().await?;
        let resp = check(resp).await?;
        let body: WdValue<T> = resp.json().await?;
        Ok(body.value)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        command: &str,
        payload: serde_json::Value,
    ) -> PageResult<T> {
        let resp = self
            .http
            .post(self.url(command))
            .json(&payload)
            .send()
            .await?;
        let resp = check(resp).await?;
        let body: WdValue<T> = resp.json().await?;
        Ok(body.value)
    }
}

async fn find_from(
    driver: &Arc<Driver>,
    command: &str,
    locator: &Locator,
) -> PageResult<Vec<Box<dyn Element>>> {
    let (using, value) = strategy(locator);
    let refs: Vec<serde_json::Value> = driver
        .post_json(command, json!({ "using": using, "value": value }))
        .await?;
    let mut elements: Vec<Box<dyn Element>> = Vec::new();
    for r in refs {
        let id = r
            .get(ELEMENT_KEY)
            .and_then(|v| v.as_str())
            .ok_or_else(|| PageError::Protocol(format!("malformed element ref: {r}")))?;
        elements.push(Box::new(WdElement {
            driver: Arc::clone(driver),
            id: id.to_string(),
        }));
    }
    Ok(elements)
}

/// Send keys to the document body.
async fn body_keys(driver: &Arc<Driver>, text: &str) -> PageResult<()> {
    let body = find_from(driver, "elements", &Locator::tag("body"))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| PageError::Protocol("no <body> element".to_string()))?;
    body.type_text(text).await
}

async fn check(resp: reqwest::Response) -> PageResult<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(PageError::Protocol(format!("{status}: {body}")))
}

fn strategy(locator: &Locator) -> (&'static str, String) {
    match locator {
        Locator::Id(v) => ("css selector", format!("[id='{v}']")),
        Locator::Css(v) => ("css selector", v.clone()),
        Locator::PartialLinkText(v) => ("partial link text", v.clone()),
        Locator::Tag(v) => ("tag name", v.clone()),
    }
}

pub struct WebDriverPage {
    driver: Arc<Driver>,
}

impl WebDriverPage {
    /// Open a headless Chrome session against a chromedriver endpoint.
    pub async fn connect(endpoint: &str) -> PageResult<WebDriverPage> {
        let http = reqwest::Client::new();
        let base = endpoint.trim_end_matches('/').to_string();

        let caps = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": [
                            "--headless",
                            "--disable-gpu",
                            "--no-sandbox",
                            "--disable-dev-shm-usage",
                            "--window-size=1920,1080",
                        ]
                    }
                }
            }
        });

        let resp = http
            .post(format!("{base}/session"))
            .json(&caps)
            .send()
            .await?;
        let resp = check(resp).await?;
        let session: WdValue<NewSession> = resp.json().await?;
        info!(session = %session.value.session_id, "WebDriver session created");

        Ok(WebDriverPage {
            driver: Arc::new(Driver {
                http,
                base,
                session: session.value.session_id,
            }),
        })
    }
}

#[async_trait]
impl Page for WebDriverPage {
    async fn goto(&self, url: &str) -> PageResult<()> {
        let _: serde_json::Value = self.driver.post_json("url", json!({ "url": url })).await?;
        Ok(())
    }

    async fn find_all(&self, locator: &Locator) -> PageResult<Vec<Box<dyn Element>>> {
        find_from(&self.driver, "elements", locator).await
    }

    async fn press_escape(&self) -> PageResult<()> {
        body_keys(&self.driver, ESCAPE_KEY).await
    }

    async fn cookie_header(&self) -> PageResult<String> {
        let cookies: Vec<WdCookie> = self.driver.get_json("cookie").await?;
        Ok(cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; "))
    }

    async fn user_agent(&self) -> PageResult<String> {
        self.driver
            .post_json(
                "execute/sync",
                json!({ "script": "return navigator.userAgent;", "args": [] }),
            )
            .await
    }

    async fn window_handles(&self) -> PageResult<Vec<String>> {
        self.driver.get_json("window/handles").await
    }

    async fn current_window(&self) -> PageResult<String> {
        self.driver.get_json("window").await
    }

    async fn switch_to_window(&self, handle: &str) -> PageResult<()> {
        let _: serde_json::Value = self
            .driver
            .post_json("window", json!({ "handle": handle }))
            .await?;
        Ok(())
    }

    async fn close(&self) -> PageResult<()> {
        let resp = self
            .driver
            .http
            .delete(format!(
                "{}/session/{}",
                self.driver.base, self.driver.session
            ))
            .send()
            .await?;
        check(resp).await?;
        info!("WebDriver session closed");
        Ok(())
    }
}

struct WdElement {
    driver: Arc<Driver>,
    id: String,
}

impl WdElement {
    fn command(&self, suffix: &str) -> String {
        format!("element/{}/{}", self.id, suffix)
    }

    fn element_ref(&self) -> serde_json::Value {
        json!({ ELEMENT_KEY: self.id })
    }
}

#[async_trait]
impl Element for WdElement {
    async fn text(&self) -> PageResult<String> {
        self.driver.get_json(&self.command("text")).await
    }

    async fn attr(&self, name: &str) -> PageResult<Option<String>> {
        self.driver
            .get_json(&self.command(&format!("attribute/{name}")))
            .await
    }

    async fn click(&self) -> PageResult<()> {
        let _: serde_json::Value = self
            .driver
            .post_json(&self.command("click"), json!({}))
            .await?;
        Ok(())
    }

    async fn clear(&self) -> PageResult<()> {
        let _: serde_json::Value = self
            .driver
            .post_json(&self.command("clear"), json!({}))
            .await?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> PageResult<()> {
        let _: serde_json::Value = self
            .driver
            .post_json(&self.command("value"), json!({ "text": text }))
            .await?;
        Ok(())
    }

    async fn is_displayed(&self) -> PageResult<bool> {
        self.driver.get_json(&self.command("displayed")).await
    }

    async fn scroll_into_view(&self) -> PageResult<()> {
        let _: serde_json::Value = self
            .driver
            .post_json(
                "execute/sync",
                json!({
                    "script": "arguments[0].scrollIntoView({block: 'center'});",
                    "args": [self.element_ref()],
                }),
            )
            .await?;
        Ok(())
    }

    async fn find_all(&self, locator: &Locator) -> PageResult<Vec<Box<dyn Element>>> {
        find_from(&self.driver, &self.command("elements"), locator).await
    }
}
