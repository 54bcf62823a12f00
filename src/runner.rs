//! Run controller: one pass over the year range, one card at a time.
//!
//! Everything is strictly sequential: the reveal overlay and the ledger
//! are both singly-owned, so there is nothing to parallelize. Cancellation
//! is a cooperative flag observed between years and between cards; work in
//! flight for the current card finishes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use time::{Date, Month, OffsetDateTime};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::delivery::{InvoiceDelivery, build_filename};
use crate::error::Result;
use crate::invoice_links::{self, extract_invoice_links};
use crate::ledger::Ledger;
use crate::order_parser::{
    self, extract_order_info, format_date_for_filename, is_older_than_14_days, parse_price,
};
use crate::page::{Element, Locator, Page};
use crate::storefront;

/// Cooperative cancellation observer, shared with the signal handler.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct RunStats {
    pub cards_seen: usize,
    pub invoices_completed: usize,
    pub invoices_failed: usize,
}

/// Which order-history years are worth visiting. During the first 8 weeks
/// of a year the previous year is still in scope (late invoices), clamped
/// to the configured floor.
pub fn years_to_check(today: Date, min_year: Option<i32>) -> Vec<i32> {
    let current_year = today.year();
    let year_start =
        Date::from_calendar_date(current_year, Month::January, 1).expect("January 1st exists");
    let weeks_since_year_start = (today - year_start).whole_days() / 7;
    let floor = min_year.unwrap_or(i32::MIN);

    let mut years = Vec::new();
    if weeks_since_year_start < 8 && current_year - 1 >= floor {
        years.push(current_year - 1);
    }
    if current_year >= floor {
        years.push(current_year);
    }
    years
}

pub struct Runner<'a> {
    page: &'a dyn Page,
    config: &'a Config,
    ledger: &'a Ledger,
    delivery: &'a dyn InvoiceDelivery,
    cancel: CancelFlag,
}

impl<'a> Runner<'a> {
    pub fn new(
        page: &'a dyn Page,
        config: &'a Config,
        ledger: &'a Ledger,
        delivery: &'a dyn InvoiceDelivery,
        cancel: CancelFlag,
    ) -> Self {
        Runner {
            page,
            config,
            ledger,
            delivery,
            cancel,
        }
    }

    /// One complete run: login, then every in-scope year. The caller owns
    /// the browser session and must release it whatever this returns.
    pub async fn run(&self) -> Result<RunStats> {
        let mut stats = RunStats::default();
        if self.cancel.is_requested() {
            info!("Cancellation requested before starting");
            return Ok(stats);
        }

        storefront::login(
            self.page,
            &self.config.amazon.email,
            &self.config.amazon.password,
        )
        .await?;

        let years = years_to_check(OffsetDateTime::now_utc().date(), self.config.amazon.min_year);
        if years.is_empty() {
            warn!("No years in scope; nothing to do");
            return Ok(stats);
        }
        info!(years = ?years, "Years to check");

        for (idx, year) in years.iter().enumerate() {
            if self.cancel.is_requested() {
                info!("Cancellation requested, stopping");
                break;
            }
            info!(year = year, "Processing orders for year");
            storefront::navigate_to_order_history(self.page, Some(*year)).await?;
            if self.cancel.is_requested() {
                info!("Cancellation requested, stopping");
                break;
            }

            self.process_order_cards(&mut stats).await?;

            if idx + 1 < years.len() {
                sleep(Duration::from_secs(2)).await;
            }
        }

        if !self.cancel.is_requested() {
            info!("Finished processing all years");
        }
        Ok(stats)
    }

    /// Enumerate the order cards on the current page and run the per-card
    /// pipeline on each. A failure inside one card never stops the loop.
    async fn process_order_cards(&self, stats: &mut RunStats) -> Result<()> {
        // Let asynchronous rendering settle before enumerating.
        sleep(Duration::from_secs(3)).await;

        let mut cards = self.page.find_all(&Locator::id("orderCard")).await?;
        if cards.is_empty() {
            cards = self
                .page
                .find_all(&Locator::css("div[id='orderCard']"))
                .await?;
        }
        if cards.is_empty() {
            warn!("No order cards found on the page");
            return Ok(());
        }
        info!(count = cards.len(), "Found order cards to process");

        if let Some(folder) = &self.config.storage.output_folder {
            std::fs::create_dir_all(folder)?;
        }

        for (idx, card) in cards.iter().enumerate() {
            if self.cancel.is_requested() {
                info!("Cancellation requested, stopping card loop");
                break;
            }
            stats.cards_seen += 1;
            if let Err(error) = self.process_card(card.as_ref(), stats).await {
                error!(card = idx + 1, error = %error, "Error processing order card");
                invoice_links::dismiss_overlay(self.page, Duration::from_millis(500)).await;
            }
        }

        let orders = self.ledger.processed_orders_count()?;
        let downloaded = self.ledger.downloaded_invoices_count()?;
        info!(
            orders = orders,
            downloaded = downloaded,
            "Ledger statistics"
        );
        Ok(())
    }

    async fn process_card(&self, card: &dyn Element, stats: &mut RunStats) -> Result<()> {
        let _ = card.scroll_into_view().await;
        sleep(Duration::from_millis(300)).await;

        let Some(order) = extract_order_info(card).await else {
            return Ok(());
        };
        info!(
            order_id = %order.order_id,
            date = %order.date,
            price = ?order.price,
            "Processing order"
        );

        let links = extract_invoice_links(self.page, card).await;
        let current_count = links.len();
        let stored_count = self.ledger.stored_invoice_count(&order.order_id)?;
        let urls: Vec<String> = links.iter().map(|link| link.href.clone()).collect();

        // Index-based incrementality: positions below the stored count are
        // assumed handled, unless their completion marker says otherwise,
        // in which case they are retried.
        let mut new_work = Vec::new();
        for (idx, link) in links.iter().enumerate() {
            if idx >= stored_count || !self.ledger.is_invoice_complete(&link.href)? {
                new_work.push(idx);
            }
        }

        if new_work.is_empty() {
            if current_count > 0 {
                info!(
                    order_id = %order.order_id,
                    count = current_count,
                    "All invoices already handled, skipping"
                );
            }
        } else {
            info!(
                order_id = %order.order_id,
                new = new_work.len(),
                total = current_count,
                "Found new invoice(s) to download"
            );
            let date_compact = format_date_for_filename(&order.date);
            let created = order_parser::parse_order_date(&order.date);
            let title = format!("Amazon Invoice {} - {}", order.order_id, order.date);

            for &idx in &new_work {
                let link = &links[idx];
                let filename =
                    build_filename(&date_compact, &order.order_id, idx + 1, current_count);
                info!(text = %link.text, filename = %filename, "Downloading invoice");

                let outcome = self
                    .delivery
                    .deliver(self.page, &link.href, &filename, &title, created)
                    .await;
                if outcome.complete {
                    self.ledger.mark_invoice_downloaded(
                        &link.href,
                        &order.order_id,
                        outcome.local_filename.as_deref(),
                        outcome.uploaded,
                    )?;
                    stats.invoices_completed += 1;
                } else {
                    stats.invoices_failed += 1;
                }
            }
        }

        // Unconditional per-visit upsert so count drift stays observable.
        self.ledger.mark_order_processed(
            &order.order_id,
            &order.date,
            order.price.as_deref(),
            &urls,
            current_count,
        )?;

        if links.is_empty() {
            let price_value = parse_price(order.price.as_deref().unwrap_or(""));
            let old = is_older_than_14_days(&order.date, OffsetDateTime::now_utc().date());
            if price_value > 0.0 && old {
                warn!(
                    order_id = %order.order_id,
                    price = price_value,
                    "Order has a nonzero price and is older than 14 days, but no invoices were found"
                );
            }
        }

        invoice_links::dismiss_overlay(self.page, Duration::from_millis(500)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryOutcome;
    use crate::page::fake::{FakeElement, FakePage};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use time::macros::date;

    #[test]
    fn early_year_includes_previous_year() {
        assert_eq!(years_to_check(date!(2024 - 02 - 01), None), vec![2023, 2024]);
        // Week 8 boundary: day 56 is out.
        assert_eq!(years_to_check(date!(2024 - 02 - 25), None), vec![2023, 2024]);
        assert_eq!(years_to_check(date!(2024 - 02 - 26), None), vec![2024]);
    }

    #[test]
    fn late_year_is_current_only() {
        assert_eq!(years_to_check(date!(2024 - 06 - 15), None), vec![2024]);
    }

    #[test]
    fn min_year_clamps_the_range() {
        assert_eq!(
            years_to_check(date!(2024 - 01 - 20), Some(2024)),
            vec![2024]
        );
        assert_eq!(
            years_to_check(date!(2024 - 06 - 15), Some(2025)),
            Vec::<i32>::new()
        );
    }

    // ---------------------------------------------------------------------
    // Pipeline properties, driven through page fixtures and a recording
    // delivery fake.
    // ---------------------------------------------------------------------

    struct RecordingDelivery {
        calls: Mutex<Vec<(String, String)>>,
        downloaded: bool,
        uploaded: bool,
        complete: bool,
        record_filename: bool,
    }

    impl RecordingDelivery {
        fn completing() -> Self {
            RecordingDelivery {
                calls: Mutex::new(Vec::new()),
                downloaded: true,
                uploaded: false,
                complete: true,
                record_filename: true,
            }
        }

        fn failing_upload() -> Self {
            RecordingDelivery {
                calls: Mutex::new(Vec::new()),
                downloaded: true,
                uploaded: false,
                complete: false,
                record_filename: false,
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InvoiceDelivery for RecordingDelivery {
        async fn deliver(
            &self,
            _page: &dyn Page,
            href: &str,
            filename: &str,
            _title: &str,
            _created: Option<Date>,
        ) -> DeliveryOutcome {
            self.calls
                .lock()
                .unwrap()
                .push((href.to_string(), filename.to_string()));
            DeliveryOutcome {
                downloaded: self.downloaded,
                uploaded: self.uploaded,
                complete: self.complete,
                local_filename: self
                    .record_filename
                    .then(|| filename.to_string()),
            }
        }
    }

    const HREF_1: &str =
        "/documents/download/19182d45-59f9-42ca-b9db-9c53853152a0/invoice.pdf";
    const HREF_2: &str =
        "/documents/download/7b1c2f9e-0a3d-4a77-9b2f-1d2e3f4a5b6c/invoice.pdf";

    fn test_config() -> Config {
        toml::from_str(
            r#"
            [amazon]
            email = "me@example.com"
            password = "secret"

            [storage]
            db_path = ":memory:"
            output_folder = "/tmp/invoice_harvest_test_out"
            "#,
        )
        .unwrap()
    }

    fn ledger() -> Ledger {
        Ledger::open(":memory:").unwrap()
    }

    fn anchor(name: &str, href: &str) -> FakeElement {
        FakeElement::new(name)
            .with_text("Rechnung")
            .with_attr("href", href)
    }

    fn popover(hrefs: &[&str]) -> FakeElement {
        let anchors = hrefs
            .iter()
            .enumerate()
            .map(|(i, href)| anchor(&format!("a{i}"), href))
            .collect();
        FakeElement::new("popover")
            .with_children(
                Locator::css("ul.invoice-list, .invoice-list"),
                vec![FakeElement::new("invoice-list")],
            )
            .with_children(Locator::css("a[href*='invoice.pdf']"), anchors)
    }

    /// A page with one order card whose reveal overlay carries `hrefs`.
    fn page_with_order(hrefs: &[&str]) -> FakePage {
        let page = FakePage::new();
        let trigger = FakeElement::new("trigger")
            .with_text("Rechnung")
            .with_click_log(page.clicks.clone());
        let card = FakeElement::new("card")
            .with_children(
                Locator::css("#orderCardHeader .a-size-base"),
                vec![
                    FakeElement::new("date").with_text("15. Januar 2024"),
                    FakeElement::new("price").with_text("€42,99"),
                ],
            )
            .with_children(
                Locator::id("orderIdField"),
                vec![FakeElement::new("id").with_text("Bestellung 171-1234567-1234567")],
            )
            .with_children(Locator::partial_link_text("Rechnung"), vec![trigger]);
        page.with_children(Locator::id("orderCard"), vec![card])
            .with_gated(Locator::css(".a-popover"), vec![popover(hrefs)])
    }

    #[tokio::test(start_paused = true)]
    async fn downloads_single_invoice_with_expected_filename() {
        let config = test_config();
        let ledger = ledger();
        let delivery = RecordingDelivery::completing();
        let page = page_with_order(&[HREF_1]);

        let mut stats = RunStats::default();
        Runner::new(&page, &config, &ledger, &delivery, CancelFlag::new())
            .process_order_cards(&mut stats)
            .await
            .unwrap();

        let calls = delivery.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, HREF_1);
        assert_eq!(calls[0].1, "AMZ_20240115_171-1234567-1234567.pdf");
        assert_eq!(stats.invoices_completed, 1);
        assert_eq!(ledger.stored_invoice_count("171-1234567-1234567").unwrap(), 1);
        assert!(ledger.is_invoice_complete(HREF_1).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_on_unchanged_page_downloads_nothing() {
        let config = test_config();
        let ledger = ledger();
        let delivery = RecordingDelivery::completing();
        let page = page_with_order(&[HREF_1]);
        let runner = Runner::new(&page, &config, &ledger, &delivery, CancelFlag::new());

        let mut stats = RunStats::default();
        runner.process_order_cards(&mut stats).await.unwrap();
        assert_eq!(delivery.calls().len(), 1);
        let completed_before = ledger.downloaded_invoices_count().unwrap();

        runner.process_order_cards(&mut stats).await.unwrap();
        assert_eq!(delivery.calls().len(), 1, "no new downloads on second run");
        assert_eq!(ledger.downloaded_invoices_count().unwrap(), completed_before);
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_appended_descriptor_is_fetched() {
        let config = test_config();
        let ledger = ledger();
        // Previous run saw and completed one invoice.
        ledger
            .mark_order_processed(
                "171-1234567-1234567",
                "15. Januar 2024",
                Some("€42,99"),
                &[HREF_1.to_string()],
                1,
            )
            .unwrap();
        ledger
            .mark_invoice_downloaded(
                HREF_1,
                "171-1234567-1234567",
                Some("AMZ_20240115_171-1234567-1234567.pdf"),
                false,
            )
            .unwrap();

        let delivery = RecordingDelivery::completing();
        let page = page_with_order(&[HREF_1, HREF_2]);
        let mut stats = RunStats::default();
        Runner::new(&page, &config, &ledger, &delivery, CancelFlag::new())
            .process_order_cards(&mut stats)
            .await
            .unwrap();

        let calls = delivery.calls();
        assert_eq!(calls.len(), 1, "descriptor index 0 is untouched");
        assert_eq!(calls[0].0, HREF_2);
        // Ordinal suffix reflects position in the full list.
        assert_eq!(calls[0].1, "AMZ_20240115_171-1234567-1234567_2.pdf");
        assert_eq!(ledger.stored_invoice_count("171-1234567-1234567").unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn recorded_but_incomplete_invoice_is_retried() {
        let config = test_config();
        let ledger = ledger();
        // Previous run observed the invoice (count 1) but delivery failed,
        // so no completion marker was written.
        ledger
            .mark_order_processed(
                "171-1234567-1234567",
                "15. Januar 2024",
                Some("€42,99"),
                &[HREF_1.to_string()],
                1,
            )
            .unwrap();

        let delivery = RecordingDelivery::completing();
        let page = page_with_order(&[HREF_1]);
        let mut stats = RunStats::default();
        Runner::new(&page, &config, &ledger, &delivery, CancelFlag::new())
            .process_order_cards(&mut stats)
            .await
            .unwrap();

        // The low-water mark alone would have masked it.
        assert_eq!(delivery.calls().len(), 1);
        assert!(ledger.is_invoice_complete(HREF_1).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_leaves_invoice_incomplete() {
        let config = test_config();
        let ledger = ledger();
        let delivery = RecordingDelivery::failing_upload();
        let page = page_with_order(&[HREF_1]);

        let mut stats = RunStats::default();
        Runner::new(&page, &config, &ledger, &delivery, CancelFlag::new())
            .process_order_cards(&mut stats)
            .await
            .unwrap();

        assert_eq!(stats.invoices_failed, 1);
        assert!(!ledger.is_invoice_complete(HREF_1).unwrap());
        assert_eq!(ledger.downloaded_invoices_count().unwrap(), 0);
        // The order row still records the observed count.
        assert_eq!(ledger.stored_invoice_count("171-1234567-1234567").unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_invoice_old_order_is_not_an_error() {
        let config = test_config();
        let ledger = ledger();
        let delivery = RecordingDelivery::completing();
        // Card without any invoice trigger: valid empty outcome.
        let page = FakePage::new().with_children(
            Locator::id("orderCard"),
            vec![
                FakeElement::new("card")
                    .with_children(
                        Locator::css("#orderCardHeader .a-size-base"),
                        vec![
                            FakeElement::new("date").with_text("15. Januar 2024"),
                            FakeElement::new("price").with_text("€0,00"),
                        ],
                    )
                    .with_children(
                        Locator::id("orderIdField"),
                        vec![FakeElement::new("id").with_text("171-1234567-1234567")],
                    ),
            ],
        );

        let mut stats = RunStats::default();
        Runner::new(&page, &config, &ledger, &delivery, CancelFlag::new())
            .process_order_cards(&mut stats)
            .await
            .unwrap();

        assert!(delivery.calls().is_empty());
        assert_eq!(ledger.stored_invoice_count("171-1234567-1234567").unwrap(), 0);
        assert_eq!(ledger.processed_orders_count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_before_new_work() {
        let config = test_config();
        let ledger = ledger();
        let delivery = RecordingDelivery::completing();
        let page = page_with_order(&[HREF_1]);

        let cancel = CancelFlag::new();
        cancel.request();
        let mut stats = RunStats::default();
        Runner::new(&page, &config, &ledger, &delivery, cancel)
            .process_order_cards(&mut stats)
            .await
            .unwrap();

        assert!(delivery.calls().is_empty());
        assert_eq!(stats.cards_seen, 0);
    }
}
