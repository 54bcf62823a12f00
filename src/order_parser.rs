//! Field extraction from a single rendered order card.

use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::debug;

use crate::page::{Element, Locator};

/// German month names paired with the English spelling the date formats
/// expect. Months with identical spelling are listed for detection only.
const MONTH_MAP: [(&str, &str); 12] = [
    ("Januar", "January"),
    ("Februar", "February"),
    ("März", "March"),
    ("April", "April"),
    ("Mai", "May"),
    ("Juni", "June"),
    ("Juli", "July"),
    ("August", "August"),
    ("September", "September"),
    ("Oktober", "October"),
    ("November", "November"),
    ("Dezember", "December"),
];

const MONTH_NAMES_EN: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

#[derive(Debug, Clone)]
pub struct OrderInfo {
    pub order_id: String,
    /// Raw localized date text as rendered on the card.
    pub date: String,
    /// Raw localized price text, if the card showed one.
    pub price: Option<String>,
}

fn contains_month_name(text: &str) -> bool {
    MONTH_MAP.iter().any(|(de, _)| text.contains(de))
        || MONTH_NAMES_EN.iter().any(|en| text.contains(en))
}

/// Pick the order identifier out of an id-field's text: storefront order IDs
/// are dash-delimited and longer than any date or price token.
fn pick_order_token(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|part| part.contains('-') && part.len() > 10)
        .map(str::to_string)
}

/// Extract `{date, price, order_id}` from an order card, or `None` when the
/// card is incomplete (partially rendered, promotional). Incomplete cards
/// must never create ledger entries, so this takes no side effects.
pub async fn extract_order_info(card: &dyn Element) -> Option<OrderInfo> {
    let headers = card
        .find_all(&Locator::css("#orderCardHeader .a-size-base"))
        .await
        .unwrap_or_default();
    let mut fragments = Vec::new();
    for elem in &headers {
        if let Ok(text) = elem.text().await {
            fragments.push(text.trim().to_string());
        }
    }

    let date = fragments.iter().find(|t| contains_month_name(t)).cloned();
    let price = fragments.iter().find(|t| t.contains('€')).cloned();

    let mut id_fields = card
        .find_all(&Locator::id("orderIdField"))
        .await
        .unwrap_or_default();
    if id_fields.is_empty() {
        id_fields = card
            .find_all(&Locator::css("*[id*='orderId'], *[id*='OrderId']"))
            .await
            .unwrap_or_default();
    }

    let mut order_id = None;
    if let Some(field) = id_fields.first() {
        if let Ok(text) = field.text().await {
            order_id = pick_order_token(&text);
        }
    }

    match (date, order_id) {
        (Some(date), Some(order_id)) => Some(OrderInfo {
            order_id,
            date,
            price,
        }),
        (date, order_id) => {
            debug!(
                has_date = date.is_some(),
                has_order_id = order_id.is_some(),
                "Skipping incomplete order card"
            );
            None
        }
    }
}

/// Parse a localized order-date string into a calendar date. Returns `None`
/// on total failure; callers fall back to "now" only for filename
/// formatting, never for business decisions.
pub fn parse_order_date(date: &str) -> Option<Date> {
    let mut cleaned = date.replace('.', "");
    for (de, en) in MONTH_MAP {
        cleaned = cleaned.replace(de, en);
    }
    let cleaned = cleaned.trim();

    let long_month =
        format_description!("[day padding:none] [month repr:long case_sensitive:false] [year]");
    let short_month =
        format_description!("[day padding:none] [month repr:short case_sensitive:false] [year]");
    let spaced_numeric = format_description!("[day padding:none] [month padding:none] [year]");
    for format in [long_month, short_month, spaced_numeric] {
        if let Ok(parsed) = Date::parse(cleaned, format) {
            return Some(parsed);
        }
    }

    // Dotted numeric dates keep their separators, so try the raw text.
    let dotted = format_description!("[day padding:none].[month padding:none].[year]");
    Date::parse(date.trim(), dotted).ok()
}

/// Format an order date as `YYYYMMDD` for filenames. Unparseable dates fall
/// back to today.
pub fn format_date_for_filename(date: &str) -> String {
    let compact = format_description!("[year][month][day]");
    let day = parse_order_date(date).unwrap_or_else(|| OffsetDateTime::now_utc().date());
    day.format(compact)
        .unwrap_or_else(|_| "00000000".to_string())
}

/// Parse a localized price string into a decimal. Unparseable prices
/// collapse to 0.0.
pub fn parse_price(price: &str) -> f64 {
    let normalized = price.replace('€', "").replace(',', ".");
    let digits: String = normalized
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse().unwrap_or(0.0)
}

/// Whether the order date lies more than 14 days before `today`. Used for
/// anomaly warnings only.
pub fn is_older_than_14_days(date: &str, today: Date) -> bool {
    match parse_order_date(date) {
        Some(parsed) => (today - parsed).whole_days() > 14,
        None => false,
    }
}
