//! Storefront flows: sign-in, order-history navigation, year discovery.

use std::time::Duration;

use regex::Regex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::page::{Element, Locator, Page, PageError, PageResult};

pub const STOREFRONT_ORIGIN: &str = "https://www.amazon.de";
const BUSINESS_HOME: &str = "https://business.amazon.de";

const NEW_WINDOW_TIMEOUT: Duration = Duration::from_secs(10);

async fn first(page: &dyn Page, locator: &Locator) -> PageResult<Option<Box<dyn Element>>> {
    Ok(page.find_all(locator).await?.into_iter().next())
}

fn missing(what: &str) -> PageError {
    PageError::Protocol(format!("{what} not found"))
}

/// Sign in to the business storefront. The sign-in form opens in a second
/// window; we follow it, submit credentials and come back settled.
pub async fn login(page: &dyn Page, email: &str, password: &str) -> PageResult<()> {
    info!("Logging in to Amazon Business...");
    page.goto(BUSINESS_HOME).await?;
    sleep(Duration::from_secs(2)).await;

    let original_window = page.current_window().await?;

    let sign_in = first(page, &Locator::css("a[data-signin-link='true']"))
        .await?
        .ok_or_else(|| missing("sign-in link"))?;
    sign_in.click().await?;

    let deadline = Instant::now() + NEW_WINDOW_TIMEOUT;
    loop {
        let handles = page.window_handles().await?;
        if let Some(handle) = handles.iter().find(|h| **h != original_window) {
            page.switch_to_window(handle).await?;
            break;
        }
        if Instant::now() >= deadline {
            return Err(missing("sign-in window"));
        }
        sleep(Duration::from_millis(500)).await;
    }
    sleep(Duration::from_secs(1)).await;

    let email_input = first(page, &Locator::css("input[type='email']"))
        .await?
        .ok_or_else(|| missing("email input"))?;
    email_input.clear().await?;
    email_input.type_text(email).await?;

    let password_input = first(page, &Locator::css("input[type='password']"))
        .await?
        .ok_or_else(|| missing("password input"))?;
    password_input.clear().await?;
    password_input.type_text(password).await?;

    let submit = first(page, &Locator::id("signInSubmit"))
        .await?
        .ok_or_else(|| missing("sign-in button"))?;
    submit.click().await?;

    sleep(Duration::from_secs(3)).await;
    info!("Sign-in completed successfully");

    dismiss_passkey_prompt(page).await;
    Ok(())
}

/// Best-effort dismissal of the passkey interstitial. It may simply not be
/// there; every failure is swallowed.
async fn dismiss_passkey_prompt(page: &dyn Page) {
    sleep(Duration::from_secs(2)).await;

    const SKIP_WORDS: [&str; 5] = ["not now", "skip", "maybe later", "no thanks", "dismiss"];

    for tag in ["button", "a", "span"] {
        let elements = page.find_all(&Locator::tag(tag)).await.unwrap_or_default();
        for element in &elements {
            let text = element.text().await.unwrap_or_default().to_lowercase();
            if !SKIP_WORDS.iter().any(|word| text.contains(word)) {
                continue;
            }
            if element.is_displayed().await.unwrap_or(false) && element.click().await.is_ok() {
                info!("Dismissed passkey prompt");
                sleep(Duration::from_secs(2)).await;
                return;
            }
        }
    }

    let close_buttons = page
        .find_all(&Locator::css(
            "button[aria-label*='close'], button[aria-label*='Close'], .close-button, [data-action='close']",
        ))
        .await
        .unwrap_or_default();
    for button in &close_buttons {
        if button.is_displayed().await.unwrap_or(false) && button.click().await.is_ok() {
            info!("Dismissed passkey prompt");
            sleep(Duration::from_secs(2)).await;
            return;
        }
    }
    debug!("No passkey prompt to dismiss");
}

/// Navigate to the order-history page, optionally filtered to one year.
pub async fn navigate_to_order_history(page: &dyn Page, year: Option<i32>) -> PageResult<()> {
    match year {
        Some(year) => {
            info!(year = year, "Navigating to order history");
            page.goto(&format!(
                "{STOREFRONT_ORIGIN}/gp/css/order-history#time/{year}/pagination/1/"
            ))
            .await?;
        }
        None => {
            info!("Navigating to order history (no year filter)");
            page.goto(&format!("{STOREFRONT_ORIGIN}/gp/css/order-history"))
                .await?;
        }
    }
    sleep(Duration::from_secs(1)).await;

    if year.is_none() {
        list_available_years(page).await;
    }
    Ok(())
}

/// Read the time-filter dropdown and log which years the storefront offers.
async fn list_available_years(page: &dyn Page) {
    let Ok(Some(dropdown)) = first(page, &Locator::id("timeFilterDropdown")).await else {
        warn!("Time filter dropdown not found on the page");
        return;
    };

    let options = dropdown
        .find_all(&Locator::tag("option"))
        .await
        .unwrap_or_default();
    let mut years = Vec::new();
    for option in &options {
        if let Ok(Some(value)) = option.attr("value").await {
            if let Some(year) = extract_year_from_value(&value) {
                years.push(year);
            }
        }
    }

    if !years.is_empty() {
        years.sort();
        info!(years = %years.join(", "), "Available order-history years");
    }
}

/// Dropdown values come in several shapes: a bare year, a prefixed
/// `timeFilterDropdown_2024`, or a year embedded in arbitrary text.
fn extract_year_from_value(value: &str) -> Option<String> {
    if value.len() == 4 && value.chars().all(|c| c.is_ascii_digit()) {
        return Some(value.to_string());
    }
    if let Some(suffix) = value.strip_prefix("timeFilterDropdown_") {
        if suffix.len() == 4 && suffix.chars().all(|c| c.is_ascii_digit()) {
            return Some(suffix.to_string());
        }
    }
    let re = Regex::new(r"\b((?:19|20)\d{2})\b").ok()?;
    re.captures(value).map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn year_from_dropdown_values() {
        assert_eq!(extract_year_from_value("2024"), Some("2024".to_string()));
        assert_eq!(
            extract_year_from_value("timeFilterDropdown_2021"),
            Some("2021".to_string())
        );
        assert_eq!(
            extract_year_from_value("orders placed in 2019"),
            Some("2019".to_string())
        );
        assert_eq!(extract_year_from_value("last30"), None);
        assert_eq!(extract_year_from_value("3024"), None);
    }
}
