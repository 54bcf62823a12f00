//! Reveal-and-extract protocol for invoice links.
//!
//! Invoice links are not in the DOM until a trigger on the order card is
//! clicked and a popover materializes. One protocol pass per card:
//! dismiss whatever the previous card left open, find and click the
//! trigger, wait (bounded) for a visible popover carrying an invoice list,
//! read the links, dismiss the popover again.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::page::{Element, Locator, Page};

/// A single invoice descriptor as rendered in the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceLink {
    pub text: String,
    pub href: String,
}

/// Popovers render asynchronously and can be very slow on a loaded page.
const OVERLAY_TIMEOUT: Duration = Duration::from_secs(30);
const OVERLAY_POLL: Duration = Duration::from_millis(500);

/// Run the full reveal protocol against one order card.
///
/// Every failure mode degrades to an empty (or partial) list; nothing here
/// propagates. An order without invoices is a normal outcome.
pub async fn extract_invoice_links(page: &dyn Page, card: &dyn Element) -> Vec<InvoiceLink> {
    dismiss_overlay(page, Duration::from_millis(300)).await;

    let Some(trigger) = find_reveal_trigger(card).await else {
        debug!("No invoice trigger on this card");
        return Vec::new();
    };

    let _ = trigger.scroll_into_view().await;
    sleep(Duration::from_millis(200)).await;
    if let Err(error) = trigger.click().await {
        warn!(error = %error, "Could not click invoice trigger");
        return Vec::new();
    }
    sleep(Duration::from_secs(1)).await;

    let links = match wait_for_overlay(page, OVERLAY_TIMEOUT).await {
        Some(overlay) => collect_links(overlay.as_ref()).await,
        None => {
            warn!("Invoice overlay did not appear within timeout");
            Vec::new()
        }
    };

    dismiss_overlay(page, Duration::from_millis(500)).await;
    links
}

/// Send ESC to drop any open overlay. Best-effort.
pub async fn dismiss_overlay(page: &dyn Page, settle: Duration) {
    let _ = page.press_escape().await;
    sleep(settle).await;
}

/// Locate the reveal control: a "Rechnung" link (but not the "Rechnung
/// anfordern" request variant), falling back to structural selectors.
async fn find_reveal_trigger(card: &dyn Element) -> Option<Box<dyn Element>> {
    let mut candidates = card
        .find_all(&Locator::partial_link_text("Rechnung"))
        .await
        .unwrap_or_default();
    if candidates.is_empty() {
        candidates = card
            .find_all(&Locator::css(
                "a[href*='invoice'], a.popover-trigger, a[data-action='a-popover']",
            ))
            .await
            .unwrap_or_default();
    }

    for candidate in candidates {
        let text = candidate.text().await.unwrap_or_default();
        let href = candidate
            .attr("href")
            .await
            .unwrap_or_default()
            .unwrap_or_default();
        let class = candidate
            .attr("class")
            .await
            .unwrap_or_default()
            .unwrap_or_default();

        let labeled = text.contains("Rechnung") && !text.to_lowercase().contains("anfordern");
        let structural =
            href.to_lowercase().contains("invoice") && class.to_lowercase().contains("popover");
        if labeled || structural {
            return Some(candidate);
        }
    }
    None
}

/// Bounded poll for a popover that is rendered, not aria-hidden, and
/// contains a recognizable invoice list.
async fn wait_for_overlay(page: &dyn Page, timeout: Duration) -> Option<Box<dyn Element>> {
    let deadline = Instant::now() + timeout;
    loop {
        let popovers = match page.find_all(&Locator::css(".a-popover")).await {
            Ok(popovers) => popovers,
            Err(error) => {
                debug!(error = %error, "Popover scan failed");
                Vec::new()
            }
        };

        for popover in popovers {
            if overlay_ready(popover.as_ref()).await {
                return Some(popover);
            }
        }

        if Instant::now() >= deadline {
            return None;
        }
        sleep(OVERLAY_POLL).await;
    }
}

async fn overlay_ready(popover: &dyn Element) -> bool {
    if !popover.is_displayed().await.unwrap_or(false) {
        return false;
    }
    if popover.attr("aria-hidden").await.ok().flatten().as_deref() == Some("true") {
        return false;
    }
    popover
        .find_all(&Locator::css("ul.invoice-list, .invoice-list"))
        .await
        .map(|found| !found.is_empty())
        .unwrap_or(false)
}

/// Collect every invoice link inside the overlay, deduplicated by href in
/// first-seen order. Ordinal numbering downstream depends on this order.
async fn collect_links(overlay: &dyn Element) -> Vec<InvoiceLink> {
    let anchors = match overlay
        .find_all(&Locator::css("a[href*='invoice.pdf']"))
        .await
    {
        Ok(anchors) => anchors,
        Err(error) => {
            debug!(error = %error, "Could not read overlay links");
            return Vec::new();
        }
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut links = Vec::new();
    for anchor in anchors {
        let Ok(Some(href)) = anchor.attr("href").await else {
            continue;
        };
        if !href.contains("invoice.pdf") || !seen.insert(href.clone()) {
            continue;
        }

        let text = link_label(anchor.as_ref(), links.len() + 1).await;
        links.push(InvoiceLink { text, href });
    }
    links
}

/// Display-text fallback chain: visible text, textContent, innerText,
/// first span child, then a synthesized label.
async fn link_label(anchor: &dyn Element, ordinal: usize) -> String {
    if let Ok(text) = anchor.text().await {
        let text = text.trim();
        if !text.is_empty() {
            return text.to_string();
        }
    }
    for attr in ["textContent", "innerText"] {
        if let Ok(Some(value)) = anchor.attr(attr).await {
            let value = value.trim();
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    if let Ok(spans) = anchor.find_all(&Locator::tag("span")).await {
        if let Some(span) = spans.first() {
            if let Ok(text) = span.text().await {
                let text = text.trim();
                if !text.is_empty() {
                    return text.to_string();
                }
            }
        }
    }
    format!("Rechnung {ordinal}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::fake::{FakeElement, FakePage};

    fn invoice_list_marker() -> FakeElement {
        FakeElement::new("invoice-list")
    }

    fn anchor(name: &str, href: &str, text: &str) -> FakeElement {
        FakeElement::new(name)
            .with_text(text)
            .with_attr("href", href)
    }

    fn popover(anchors: Vec<FakeElement>) -> FakeElement {
        FakeElement::new("popover")
            .with_children(
                Locator::css("ul.invoice-list, .invoice-list"),
                vec![invoice_list_marker()],
            )
            .with_children(Locator::css("a[href*='invoice.pdf']"), anchors)
    }

    fn page_with_popover(popover: FakeElement) -> FakePage {
        FakePage::new().with_gated(Locator::css(".a-popover"), vec![popover])
    }

    fn card_with_trigger(page: &FakePage) -> FakeElement {
        let trigger = FakeElement::new("trigger")
            .with_text("Rechnung")
            .with_click_log(page.clicks.clone());
        FakeElement::new("card").with_children(Locator::partial_link_text("Rechnung"), vec![trigger])
    }

    #[tokio::test(start_paused = true)]
    async fn reveals_and_dedupes_links() {
        let page = page_with_popover(popover(vec![
            anchor("a1", "/documents/download/aaa/invoice.pdf", "Rechnung 1"),
            anchor("a2", "/documents/download/bbb/invoice.pdf", "Rechnung 2"),
            anchor("dup", "/documents/download/aaa/invoice.pdf", "Rechnung 1"),
        ]));
        let card = card_with_trigger(&page);

        let links = extract_invoice_links(&page, &card).await;
        assert_eq!(
            links,
            vec![
                InvoiceLink {
                    text: "Rechnung 1".to_string(),
                    href: "/documents/download/aaa/invoice.pdf".to_string(),
                },
                InvoiceLink {
                    text: "Rechnung 2".to_string(),
                    href: "/documents/download/bbb/invoice.pdf".to_string(),
                },
            ]
        );
        // Dismissed before triggering and again after extraction.
        assert!(page.escape_count() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_trigger_is_a_valid_empty_outcome() {
        let page = FakePage::new();
        let card = FakeElement::new("card");
        assert!(extract_invoice_links(&page, &card).await.is_empty());
        assert!(page.clicks.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn request_invoice_variant_is_excluded() {
        let page = FakePage::new();
        let trigger = FakeElement::new("request")
            .with_text("Rechnung anfordern")
            .with_click_log(page.clicks.clone());
        let card = FakeElement::new("card")
            .with_children(Locator::partial_link_text("Rechnung"), vec![trigger]);

        assert!(extract_invoice_links(&page, &card).await.is_empty());
        assert!(page.clicks.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn structural_fallback_matches_popover_trigger() {
        let page = page_with_popover(popover(vec![anchor(
            "a1",
            "/documents/download/ccc/invoice.pdf",
            "Rechnung 1",
        )]));
        let trigger = FakeElement::new("trigger")
            .with_attr("href", "/gp/invoice/popup")
            .with_attr("class", "a-popover-trigger")
            .with_click_log(page.clicks.clone());
        let card = FakeElement::new("card").with_children(
            Locator::css("a[href*='invoice'], a.popover-trigger, a[data-action='a-popover']"),
            vec![trigger],
        );

        let links = extract_invoice_links(&page, &card).await;
        assert_eq!(links.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlay_timeout_yields_empty() {
        // Trigger exists but no popover ever materializes.
        let page = FakePage::new();
        let card = card_with_trigger(&page);
        assert!(extract_invoice_links(&page, &card).await.is_empty());
        assert_eq!(page.clicks.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_popovers_are_skipped() {
        let good = popover(vec![anchor(
            "a1",
            "/documents/download/ddd/invoice.pdf",
            "Rechnung 1",
        )]);
        let invisible = popover(vec![anchor(
            "bad1",
            "/documents/download/xxx/invoice.pdf",
            "x",
        )])
        .hidden();
        let aria_hidden = popover(vec![anchor(
            "bad2",
            "/documents/download/yyy/invoice.pdf",
            "y",
        )])
        .with_attr("aria-hidden", "true");

        let page =
            FakePage::new().with_gated(Locator::css(".a-popover"), vec![invisible, aria_hidden, good]);
        let card = card_with_trigger(&page);

        let links = extract_invoice_links(&page, &card).await;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].href, "/documents/download/ddd/invoice.pdf");
    }

    #[tokio::test(start_paused = true)]
    async fn label_fallback_chain() {
        let with_attr_text = FakeElement::new("a1")
            .with_attr("href", "/documents/download/eee/invoice.pdf")
            .with_attr("textContent", "  Rechnung März  ");
        let with_span = FakeElement::new("a2")
            .with_attr("href", "/documents/download/fff/invoice.pdf")
            .with_children(
                Locator::tag("span"),
                vec![FakeElement::new("span").with_text("Rechnung Span")],
            );
        let bare = FakeElement::new("a3").with_attr("href", "/documents/download/ggg/invoice.pdf");

        let page = page_with_popover(popover(vec![with_attr_text, with_span, bare]));
        let card = card_with_trigger(&page);

        let links = extract_invoice_links(&page, &card).await;
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].text, "Rechnung März");
        assert_eq!(links[1].text, "Rechnung Span");
        assert_eq!(links[2].text, "Rechnung 3");
    }
}
