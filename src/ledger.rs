//! Persisted reconciliation ledger.
//!
//! Two relations: `orders` (one row per order card ever seen complete) and
//! `invoices` (one row per invoice identity). Identity is the UUID segment
//! of the download URL; URLs without one fall back to a URL digest. The
//! ledger is what makes repeated runs idempotent.

use regex::Regex;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, params};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

/// Extract the UUID segment from an invoice download URL, lowercased.
/// Query-string churn does not affect the result.
pub fn extract_uuid_from_url(url: &str) -> Option<String> {
    let re = Regex::new(
        r"(?i)([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})",
    )
    .ok()?;
    re.captures(url).map(|caps| caps[1].to_lowercase())
}

/// Digest of the full URL, used for tracking and as identity fallback.
pub fn hash_url(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Durable identity of an invoice: UUID when present, URL digest otherwise.
pub fn invoice_key(url: &str) -> String {
    extract_uuid_from_url(url).unwrap_or_else(|| hash_url(url))
}

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    pub fn open<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        Self::init(Connection::open(db_path)?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                date TEXT,
                price TEXT,
                invoice_count INTEGER,
                processed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                last_checked_at TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS invoices (
                invoice_uuid TEXT PRIMARY KEY,
                invoice_url TEXT,
                invoice_hash TEXT,
                order_id TEXT,
                filename TEXT,
                paperless_uploaded INTEGER NOT NULL DEFAULT 0,
                downloaded_at TIMESTAMP,
                FOREIGN KEY (order_id) REFERENCES orders(order_id)
            )",
            [],
        )?;

        let ledger = Ledger { conn };
        ledger.migrate()?;

        // A legacy database can hold the same identity under two URLs; the
        // index is skipped there rather than refusing to open.
        if let Err(error) = ledger.conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_invoices_uuid ON invoices(invoice_uuid)",
            [],
        ) {
            debug!(error = %error, "Unique invoice index not created");
        }
        ledger.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_invoices_order_id ON invoices(order_id)",
            [],
        )?;

        info!("Ledger initialized");
        Ok(ledger)
    }

    /// Bring a legacy database (keyed by `invoice_url`, no forwarded flag)
    /// up to the current shape without losing rows. Runs on every open;
    /// NULL keys are re-backfilled from their stored URLs.
    fn migrate(&self) -> SqliteResult<()> {
        let columns = self.table_columns("invoices")?;

        if !columns.iter().any(|c| c == "invoice_uuid") {
            self.conn
                .execute("ALTER TABLE invoices ADD COLUMN invoice_uuid TEXT", [])?;
            info!("Migrated invoices table: added invoice_uuid");
        }
        if !columns.iter().any(|c| c == "invoice_hash") {
            self.conn
                .execute("ALTER TABLE invoices ADD COLUMN invoice_hash TEXT", [])?;
        }
        if !columns.iter().any(|c| c == "paperless_uploaded") {
            self.conn.execute(
                "ALTER TABLE invoices ADD COLUMN paperless_uploaded INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
            info!("Migrated invoices table: added paperless_uploaded");
        }

        let mut stmt = self.conn.prepare(
            "SELECT invoice_url FROM invoices
             WHERE invoice_uuid IS NULL AND invoice_url IS NOT NULL",
        )?;
        let urls: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<SqliteResult<_>>()?;
        drop(stmt);

        for url in &urls {
            self.conn.execute(
                "UPDATE invoices SET invoice_uuid = ?1, invoice_hash = ?2
                 WHERE invoice_url = ?3 AND invoice_uuid IS NULL",
                params![invoice_key(url), hash_url(url), url],
            )?;
        }
        if !urls.is_empty() {
            info!(backfilled = urls.len(), "Backfilled invoice identities");
        }

        Ok(())
    }

    fn table_columns(&self, table: &str) -> SqliteResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({table})"))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<SqliteResult<_>>()?;
        Ok(columns)
    }

    /// Number of invoices previously recorded for this order; the low-water
    /// mark for index-based incrementality.
    pub fn stored_invoice_count(&self, order_id: &str) -> SqliteResult<usize> {
        let count: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT invoice_count FROM orders WHERE order_id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.flatten().unwrap_or(0).max(0) as usize)
    }

    /// Upsert the order row and create-if-absent a lightweight invoice row
    /// per URL. Runs unconditionally on every visit so count drift stays
    /// observable even when nothing downloaded.
    pub fn mark_order_processed(
        &self,
        order_id: &str,
        date: &str,
        price: Option<&str>,
        invoice_urls: &[String],
        invoice_count: usize,
    ) -> SqliteResult<()> {
        self.conn.execute(
            "INSERT INTO orders (order_id, date, price, invoice_count, last_checked_at)
             VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
             ON CONFLICT(order_id) DO UPDATE SET
                date = excluded.date,
                price = excluded.price,
                invoice_count = excluded.invoice_count,
                last_checked_at = CURRENT_TIMESTAMP",
            params![order_id, date, price, invoice_count as i64],
        )?;

        for url in invoice_urls {
            self.conn.execute(
                "INSERT OR IGNORE INTO invoices (invoice_uuid, invoice_url, invoice_hash, order_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![invoice_key(url), url, hash_url(url), order_id],
            )?;
        }

        Ok(())
    }

    /// Record a completed invoice. This is the single authoritative
    /// "this invoice's work is done" signal.
    pub fn mark_invoice_downloaded(
        &self,
        invoice_url: &str,
        order_id: &str,
        filename: Option<&str>,
        paperless_uploaded: bool,
    ) -> SqliteResult<()> {
        // Update-then-insert rather than an upsert: on a legacy database the
        // row's primary key is invoice_url, and a conflict there would not
        // match an ON CONFLICT(invoice_uuid) target.
        let key = invoice_key(invoice_url);
        let updated = self.conn.execute(
            "UPDATE invoices SET
                invoice_url = ?2,
                invoice_hash = ?3,
                order_id = ?4,
                filename = ?5,
                paperless_uploaded = ?6,
                downloaded_at = CURRENT_TIMESTAMP
             WHERE invoice_uuid = ?1",
            params![
                key,
                invoice_url,
                hash_url(invoice_url),
                order_id,
                filename,
                paperless_uploaded,
            ],
        )?;
        if updated == 0 {
            self.conn.execute(
                "INSERT INTO invoices
                    (invoice_uuid, invoice_url, invoice_hash, order_id, filename, paperless_uploaded, downloaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, CURRENT_TIMESTAMP)",
                params![
                    key,
                    invoice_url,
                    hash_url(invoice_url),
                    order_id,
                    filename,
                    paperless_uploaded,
                ],
            )?;
        }
        info!(order_id = %order_id, filename = ?filename, "Invoice marked complete");
        Ok(())
    }

    /// Whether the invoice behind this URL satisfied its completion
    /// requirement on some earlier run. A recorded-but-incomplete invoice
    /// answers false and must be retried.
    pub fn is_invoice_complete(&self, invoice_url: &str) -> SqliteResult<bool> {
        let complete: Option<bool> = self
            .conn
            .query_row(
                "SELECT filename IS NOT NULL OR paperless_uploaded = 1
                 FROM invoices WHERE invoice_uuid = ?1",
                params![invoice_key(invoice_url)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(complete.unwrap_or(false))
    }

    pub fn processed_orders_count(&self) -> SqliteResult<usize> {
        self.conn
            .query_row("SELECT COUNT(DISTINCT order_id) FROM orders", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
    }

    pub fn downloaded_invoices_count(&self) -> SqliteResult<usize> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM invoices WHERE filename IS NOT NULL",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
    }
}
