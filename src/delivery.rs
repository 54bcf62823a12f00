//! Fetch, persist and forward one invoice, then derive a completion verdict.
//!
//! The invoice bytes come down over a plain GET carrying the browser
//! session's cookies; no rendering is involved. Sinks are independent:
//! a local folder write and a paperless-ngx upload. An invoice is complete
//! only when every configured sink succeeded; anything less is left for
//! the next run.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use time::Date;
use time::macros::format_description;
use tracing::{error, info, warn};

use crate::config::PaperlessConfig;
use crate::page::Page;
use crate::storefront::STOREFRONT_ORIGIN;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Replace path-hostile characters in an order id.
pub fn sanitize_order_id(order_id: &str) -> String {
    order_id.replace(['/', '\\', ':'], "-")
}

/// Deterministic invoice filename. The ordinal suffix only appears when the
/// order has more than one invoice in total.
pub fn build_filename(date_compact: &str, order_id: &str, ordinal: usize, total: usize) -> String {
    let safe_id = sanitize_order_id(order_id);
    if total > 1 {
        format!("AMZ_{date_compact}_{safe_id}_{ordinal}.pdf")
    } else {
        format!("AMZ_{date_compact}_{safe_id}.pdf")
    }
}

/// Conjunction over exactly the sinks that are configured.
pub fn completion_verdict(
    local_configured: bool,
    paperless_configured: bool,
    downloaded: bool,
    uploaded: bool,
) -> bool {
    match (local_configured, paperless_configured) {
        (true, true) => downloaded && uploaded,
        (true, false) => downloaded,
        (false, true) => uploaded,
        (false, false) => false,
    }
}

/// Outcome of one invoice delivery attempt.
#[derive(Debug, Default)]
pub struct DeliveryOutcome {
    pub downloaded: bool,
    pub uploaded: bool,
    pub complete: bool,
    /// Filename to record in the ledger; set only when a local write
    /// actually happened.
    pub local_filename: Option<String>,
}

/// The delivery seam the run controller drives. One implementation talks
/// HTTP; tests substitute a recording fake.
#[async_trait]
pub trait InvoiceDelivery: Send + Sync {
    async fn deliver(
        &self,
        page: &dyn Page,
        href: &str,
        filename: &str,
        title: &str,
        created: Option<Date>,
    ) -> DeliveryOutcome;
}

pub struct Delivery<'a> {
    http: reqwest::Client,
    output_folder: Option<&'a Path>,
    paperless: Option<&'a PaperlessConfig>,
}

impl<'a> Delivery<'a> {
    pub fn new(output_folder: Option<&'a Path>, paperless: Option<&'a PaperlessConfig>) -> Self {
        Delivery {
            http: reqwest::Client::new(),
            output_folder,
            paperless,
        }
    }

    /// GET the invoice bytes through the browser session's cookies and
    /// user agent. `None` on any failure.
    async fn fetch_invoice(&self, page: &dyn Page, href: &str, filename: &str) -> Option<Vec<u8>> {
        let url = if href.starts_with('/') {
            format!("{STOREFRONT_ORIGIN}{href}")
        } else {
            href.to_string()
        };

        let cookies = match page.cookie_header().await {
            Ok(cookies) => cookies,
            Err(error) => {
                warn!(error = %error, "Could not read session cookies");
                return None;
            }
        };
        let user_agent = match page.user_agent().await {
            Ok(agent) => agent,
            Err(error) => {
                warn!(error = %error, "Could not read user agent");
                return None;
            }
        };

        let response = self
            .http
            .get(&url)
            .header("Cookie", cookies)
            .header("User-Agent", user_agent)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                response.bytes().await.map(|b| b.to_vec()).ok()
            }
            Ok(response) => {
                error!(filename = %filename, status = %response.status(), "Invoice fetch rejected");
                None
            }
            Err(error) => {
                error!(filename = %filename, error = %error, "Invoice fetch failed");
                None
            }
        }
    }

    fn write_local(&self, folder: &Path, filename: &str, bytes: &[u8]) -> bool {
        let path = folder.join(filename);
        match std::fs::write(&path, bytes) {
            Ok(()) => true,
            Err(error) => {
                error!(path = %path.display(), error = %error, "Could not write invoice file");
                false
            }
        }
    }

    /// POST the document to paperless-ngx. Returns the task identifier on
    /// HTTP 200, `None` on anything else.
    async fn upload_to_paperless(
        &self,
        bytes: &[u8],
        filename: &str,
        title: &str,
        created: Option<Date>,
    ) -> Option<String> {
        let paperless = self.paperless?;
        let url = format!("{}/api/documents/post_document/", paperless.base_url());

        let document = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str("application/pdf")
            .ok()?;
        let mut form = reqwest::multipart::Form::new()
            .part("document", document)
            .text("title", title.to_string());

        if let Some(created) = created {
            let day_format = format_description!("[year]-[month]-[day]");
            if let Ok(formatted) = created.format(day_format) {
                form = form.text("created", formatted);
            }
        }
        if let Some(correspondent) = paperless.correspondent {
            form = form.text("correspondent", correspondent.to_string());
        }
        if let Some(document_type) = paperless.document_type {
            form = form.text("document_type", document_type.to_string());
        }
        if let Some(storage_path) = paperless.storage_path {
            form = form.text("storage_path", storage_path.to_string());
        }
        // paperless-ngx expects one repeated `tags` field per tag id.
        for tag in &paperless.tags {
            form = form.text("tags", tag.to_string());
        }

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Token {}", paperless.token))
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                let task: serde_json::Value = response.json().await.ok()?;
                let task_id = task
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| task.to_string());
                info!(filename = %filename, task = %task_id, "Uploaded to paperless-ngx");
                Some(task_id)
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(filename = %filename, status = %status, body = %body, "paperless-ngx rejected upload");
                None
            }
            Err(error) => {
                warn!(filename = %filename, error = %error, "paperless-ngx upload failed");
                None
            }
        }
    }
}

#[async_trait]
impl InvoiceDelivery for Delivery<'_> {
    /// Run the full pipeline for one new invoice descriptor. Transport and
    /// filesystem failures are logged and reflected in the outcome; nothing
    /// propagates past this boundary.
    async fn deliver(
        &self,
        page: &dyn Page,
        href: &str,
        filename: &str,
        title: &str,
        created: Option<Date>,
    ) -> DeliveryOutcome {
        let mut outcome = DeliveryOutcome::default();

        let Some(bytes) = self.fetch_invoice(page, href, filename).await else {
            error!(filename = %filename, "Failed to download invoice");
            return outcome;
        };

        match self.output_folder {
            Some(folder) => {
                if self.write_local(folder, filename, &bytes) {
                    outcome.downloaded = true;
                    outcome.local_filename = Some(filename.to_string());
                    info!(filename = %filename, "Successfully downloaded");
                }
            }
            None => {
                outcome.downloaded = true;
                info!(filename = %filename, "Successfully downloaded to memory");
            }
        }

        if self.paperless.is_some() {
            outcome.uploaded = self
                .upload_to_paperless(&bytes, filename, title, created)
                .await
                .is_some();
        }

        outcome.complete = completion_verdict(
            self.output_folder.is_some(),
            self.paperless.is_some(),
            outcome.downloaded,
            outcome.uploaded,
        );
        if !outcome.complete {
            warn!(
                filename = %filename,
                downloaded = outcome.downloaded,
                uploaded = outcome.uploaded,
                "Incomplete processing, will retry on next run"
            );
        }
        outcome
    }
}
