//! SQLite-backed invoice source, email ledger and plan directory.
//!
//! Other writers (the invoice CRUD layer, the initial-email path) share these
//! tables and store timestamps in whatever shape they like. Rows missing their
//! normalized `*_epoch_ms` column are filled in when a candidate page or a
//! tenant history is read, so those queries only ever compare epoch
//! milliseconds. Ledger rows are otherwise never updated or deleted.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use chaser_core::timestamp::{RawTimestamp, parse_instant};
use chaser_core::{
    CandidateQuery, ChaseError, EmailEvent, EmailType, EventLedger, Invoice, InvoiceSource,
    InvoiceStatus, Plan, PlanDirectory, Result, TenantSendHistory,
};

/// Persistent store for everything the chase scheduler reads and writes.
pub struct ChaserDb {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> ChaseError {
    ChaseError::store(e.to_string())
}

/// Normalize a stored timestamp text: JSON (`{"_seconds":..}`, quoted
/// strings), RFC 3339, SQLite datetime text, bare dates or epoch millis.
pub fn normalize_raw(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('"') {
        let parsed: RawTimestamp = serde_json::from_str(trimmed)
            .map_err(|e| ChaseError::InvalidTimestamp(format!("{trimmed}: {e}")))?;
        return parsed.to_instant();
    }
    parse_instant(trimmed)
}

fn value_to_instant(value: &Value) -> Option<Result<DateTime<Utc>>> {
    match value {
        Value::Null => None,
        Value::Integer(ms) => Some(RawTimestamp::Millis(*ms).to_instant()),
        Value::Real(ms) => Some(RawTimestamp::Millis(*ms as i64).to_instant()),
        Value::Text(s) if s.trim().is_empty() => None,
        Value::Text(s) => Some(normalize_raw(s)),
        Value::Blob(_) => Some(Err(ChaseError::InvalidTimestamp("blob".into()))),
    }
}

/// Tags other writers have stored for an email type.
fn stored_tags(email_type: EmailType) -> [&'static str; 2] {
    match email_type {
        EmailType::LateWeekly => ["late_weekly", "lateWeekly"],
        other => [other.as_str(), other.as_str()],
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

const INVOICE_COLUMNS: &str = "id, tenant_id, customer_email, customer_name, invoice_number, \
     amount_cents, currency, due_at, due_epoch_ms, status, payment_link";

fn row_to_invoice(row: &rusqlite::Row<'_>) -> rusqlite::Result<Invoice> {
    let id: String = row.get(0)?;
    let raw_due: Value = row.get(7)?;
    let due_ms: Option<i64> = row.get(8)?;
    let due_at = match due_ms {
        Some(ms) => from_millis(ms),
        None => match value_to_instant(&raw_due) {
            Some(Ok(t)) => Some(t),
            Some(Err(e)) => {
                tracing::warn!("⚠️ Invoice {id}: unreadable due date ({e})");
                None
            }
            None => None,
        },
    };
    let status_raw: String = row.get(9)?;
    let status = InvoiceStatus::parse(&status_raw).unwrap_or_else(|| {
        tracing::warn!("⚠️ Invoice {id}: unknown status '{status_raw}', not chasing");
        InvoiceStatus::Overdue
    });
    Ok(Invoice {
        id,
        tenant_id: row.get(1)?,
        customer_email: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        customer_name: row.get(3)?,
        invoice_number: row.get(4)?,
        amount_cents: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
        currency: row
            .get::<_, Option<String>>(6)?
            .unwrap_or_else(|| "USD".into()),
        due_at,
        status,
        payment_link: row.get(10)?,
    })
}

impl ChaserDb {
    /// Open or create the database, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| ChaseError::store(format!("DB pragma error: {e}")))?;
        Self::init(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                plan TEXT NOT NULL DEFAULT 'trial',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS invoices (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                customer_email TEXT,
                customer_name TEXT,
                invoice_number TEXT,
                amount_cents INTEGER NOT NULL DEFAULT 0,
                currency TEXT NOT NULL DEFAULT 'USD',
                due_at,                            -- any accepted timestamp shape
                due_epoch_ms INTEGER,              -- normalized copy of due_at
                status TEXT NOT NULL DEFAULT 'pending',
                payment_link TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_invoices_due ON invoices(due_epoch_ms, id);
            CREATE INDEX IF NOT EXISTS idx_invoices_unnormalized
                ON invoices(id) WHERE due_epoch_ms IS NULL;

            -- Append-only. week_number is 0 for non-weekly types.
            CREATE TABLE IF NOT EXISTS email_events (
                id TEXT PRIMARY KEY,
                invoice_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                email_type TEXT NOT NULL,
                week_number INTEGER NOT NULL DEFAULT 0,
                created_at NOT NULL,
                created_epoch_ms INTEGER,
                dry_run INTEGER NOT NULL DEFAULT 0
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_email_events_real_key
                ON email_events(invoice_id, email_type, week_number) WHERE dry_run = 0;
            CREATE INDEX IF NOT EXISTS idx_email_events_tenant
                ON email_events(tenant_id, created_epoch_ms);
            CREATE INDEX IF NOT EXISTS idx_email_events_invoice
                ON email_events(invoice_id, email_type);
            CREATE INDEX IF NOT EXISTS idx_email_events_unnormalized
                ON email_events(id) WHERE created_epoch_ms IS NULL;
         ",
            )
            .map_err(|e| ChaseError::store(format!("Migration: {e}")))?;
        Ok(())
    }

    /// Fill normalized epoch columns for rows written by other collaborators.
    /// Returns how many rows were normalized. Rows that cannot be parsed or
    /// updated are logged and left alone.
    pub fn backfill(&self) -> Result<usize> {
        let conn = self.conn();
        Self::backfill_locked(&conn)
    }

    /// Backfill on the read path. Never fails the read.
    fn normalize_pending(conn: &Connection) {
        if let Err(e) = Self::backfill_locked(conn) {
            tracing::warn!("⚠️ Timestamp backfill skipped: {e}");
        }
    }

    fn backfill_locked(conn: &Connection) -> Result<usize> {
        let mut fixed = 0;
        for (table, raw_col, epoch_col) in [
            ("invoices", "due_at", "due_epoch_ms"),
            ("email_events", "created_at", "created_epoch_ms"),
        ] {
            let pending: Vec<(String, Value)> = {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT id, {raw_col} FROM {table}
                         WHERE {epoch_col} IS NULL AND {raw_col} IS NOT NULL"
                    ))
                    .map_err(db_err)?;
                stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(db_err)?
                    .collect::<rusqlite::Result<_>>()
                    .map_err(db_err)?
            };
            for (id, raw) in pending {
                match value_to_instant(&raw) {
                    Some(Ok(t)) => {
                        let updated = conn.execute(
                            &format!("UPDATE {table} SET {epoch_col} = ?1 WHERE id = ?2"),
                            params![t.timestamp_millis(), id],
                        );
                        match updated {
                            Ok(_) => fixed += 1,
                            Err(e) => tracing::warn!("⚠️ {table} row {id} not normalized: {e}"),
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!("{table}.{raw_col} for {id} not normalized: {e}")
                    }
                    None => {}
                }
            }
        }
        if fixed > 0 {
            tracing::debug!("🔧 Normalized {fixed} stored timestamps");
        }
        Ok(fixed)
    }

    // ─── Tenants ──────────────────────────────────────────────

    pub fn upsert_tenant(&self, tenant_id: &str, name: &str, plan: Plan) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO tenants (id, name, plan) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, plan = excluded.plan",
                params![tenant_id, name, plan.as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    // ─── Invoices ─────────────────────────────────────────────

    pub fn upsert_invoice(&self, invoice: &Invoice) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO invoices (id, tenant_id, customer_email, customer_name, invoice_number,
                     amount_cents, currency, due_at, due_epoch_ms, status, payment_link)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                     tenant_id = excluded.tenant_id,
                     customer_email = excluded.customer_email,
                     customer_name = excluded.customer_name,
                     invoice_number = excluded.invoice_number,
                     amount_cents = excluded.amount_cents,
                     currency = excluded.currency,
                     due_at = excluded.due_at,
                     due_epoch_ms = excluded.due_epoch_ms,
                     status = excluded.status,
                     payment_link = excluded.payment_link,
                     updated_at = datetime('now')",
                params![
                    invoice.id,
                    invoice.tenant_id,
                    invoice.customer_email,
                    invoice.customer_name,
                    invoice.invoice_number,
                    invoice.amount_cents,
                    invoice.currency,
                    invoice.due_at.map(|d| d.to_rfc3339()),
                    invoice.due_at.map(|d| d.timestamp_millis()),
                    invoice.status.as_str(),
                    invoice.payment_link,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_invoice_status(&self, invoice_id: &str, status: InvoiceStatus) -> Result<bool> {
        let n = self
            .conn()
            .execute(
                "UPDATE invoices SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), invoice_id],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    // ─── Ledger ───────────────────────────────────────────────

    /// Every event recorded for an invoice, oldest first, dry runs included.
    pub fn events_for_invoice(&self, invoice_id: &str) -> Result<Vec<EmailEvent>> {
        let conn = self.conn();
        Self::normalize_pending(&conn);
        let mut stmt = conn
            .prepare(
                "SELECT id, invoice_id, tenant_id, email_type, week_number, created_epoch_ms, dry_run
                 FROM email_events WHERE invoice_id = ?1
                 ORDER BY created_epoch_ms, id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![invoice_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            })
            .map_err(db_err)?;

        let mut events = Vec::new();
        for row in rows {
            let (id, invoice_id, tenant_id, t, week, ms, dry_run) = row.map_err(db_err)?;
            let (Some(email_type), Some(created_at)) =
                (EmailType::parse(&t), ms.and_then(from_millis))
            else {
                tracing::warn!("⚠️ Skipping unreadable ledger row {id}");
                continue;
            };
            events.push(EmailEvent {
                id,
                invoice_id,
                tenant_id,
                email_type,
                week_number: (week > 0).then_some(week as u32),
                created_at,
                dry_run,
            });
        }
        Ok(events)
    }
}

#[async_trait]
impl InvoiceSource for ChaserDb {
    async fn candidates(&self, query: &CandidateQuery) -> Result<Vec<Invoice>> {
        let conn = self.conn();
        Self::normalize_pending(&conn);
        let (after_ms, after_id) = match &query.after {
            Some(c) => (Some(c.due_at.timestamp_millis()), Some(c.invoice_id.as_str())),
            None => (None, None),
        };
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {INVOICE_COLUMNS} FROM invoices
                 WHERE lower(status) = 'pending'
                   AND due_epoch_ms BETWEEN ?1 AND ?2
                   AND (?3 IS NULL OR (due_epoch_ms, id) > (?3, ?4))
                 ORDER BY due_epoch_ms, id
                 LIMIT ?5"
            ))
            .map_err(db_err)?;
        stmt.query_map(
            params![
                query.due_from.timestamp_millis(),
                query.due_until.timestamp_millis(),
                after_ms,
                after_id,
                query.limit as i64,
            ],
            row_to_invoice,
        )
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>> {
        self.conn()
            .query_row(
                &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1"),
                params![invoice_id],
                row_to_invoice,
            )
            .optional()
            .map_err(db_err)
    }
}

#[async_trait]
impl EventLedger for ChaserDb {
    async fn has_event(
        &self,
        invoice_id: &str,
        email_type: EmailType,
        week_number: Option<u32>,
    ) -> Result<bool> {
        let conn = self.conn();
        let [tag, legacy] = stored_tags(email_type);
        let exists: rusqlite::Result<bool> = if email_type.is_weekly() {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM email_events
                 WHERE invoice_id = ?1 AND email_type IN (?2, ?3)
                   AND week_number = ?4 AND dry_run = 0)",
                params![invoice_id, tag, legacy, week_number.unwrap_or(0)],
                |row| row.get(0),
            )
        } else {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM email_events
                 WHERE invoice_id = ?1 AND email_type IN (?2, ?3) AND dry_run = 0)",
                params![invoice_id, tag, legacy],
                |row| row.get(0),
            )
        };
        exists.map_err(|e| ChaseError::ledger(e.to_string()))
    }

    /// Weekly sends are counted per distinct week, so one week stored under
    /// both tag spellings counts once.
    async fn count_sent(&self, invoice_id: &str, email_type: EmailType) -> Result<u32> {
        let [tag, legacy] = stored_tags(email_type);
        let counted = if email_type.is_weekly() {
            "COUNT(DISTINCT week_number)"
        } else {
            "COUNT(*)"
        };
        let n: i64 = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {counted} FROM email_events
                     WHERE invoice_id = ?1 AND email_type IN (?2, ?3) AND dry_run = 0"
                ),
                params![invoice_id, tag, legacy],
                |row| row.get(0),
            )
            .map_err(|e| ChaseError::ledger(e.to_string()))?;
        Ok(n as u32)
    }

    async fn tenant_history(
        &self,
        tenant_id: &str,
        day_start: DateTime<Utc>,
    ) -> Result<TenantSendHistory> {
        let conn = self.conn();
        Self::normalize_pending(&conn);
        let (last_ms, today): (Option<i64>, i64) = conn
            .query_row(
                "SELECT MAX(created_epoch_ms),
                        COALESCE(SUM(CASE WHEN created_epoch_ms >= ?2 THEN 1 ELSE 0 END), 0)
                 FROM email_events WHERE tenant_id = ?1 AND dry_run = 0",
                params![tenant_id, day_start.timestamp_millis()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| ChaseError::ledger(e.to_string()))?;
        Ok(TenantSendHistory {
            last_sent_at: last_ms.and_then(from_millis),
            sent_today: today as u32,
        })
    }

    async fn append(&self, event: &EmailEvent) -> Result<()> {
        let week = event
            .week_number
            .filter(|_| event.email_type.is_weekly())
            .unwrap_or(0);
        let res = self.conn().execute(
            "INSERT INTO email_events
                 (id, invoice_id, tenant_id, email_type, week_number, created_at, created_epoch_ms, dry_run)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id,
                event.invoice_id,
                event.tenant_id,
                event.email_type.as_str(),
                week,
                event.created_at.to_rfc3339(),
                event.created_at.timestamp_millis(),
                event.dry_run,
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(ChaseError::DuplicateEvent(event.key()))
            }
            Err(e) => Err(ChaseError::ledger(e.to_string())),
        }
    }
}

#[async_trait]
impl PlanDirectory for ChaserDb {
    async fn plan_for(&self, tenant_id: &str) -> Result<Plan> {
        let plan: Option<String> = self
            .conn()
            .query_row(
                "SELECT plan FROM tenants WHERE id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(match plan {
            Some(p) => Plan::from_str_lossy(&p),
            None => {
                tracing::warn!("⚠️ Tenant {tenant_id} has no plan record, treating as trial");
                Plan::Trial
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn invoice(id: &str, due: DateTime<Utc>) -> Invoice {
        Invoice {
            id: id.into(),
            tenant_id: "t-1".into(),
            customer_email: "ap@customer.test".into(),
            customer_name: Some("Customer".into()),
            invoice_number: Some("INV-7".into()),
            amount_cents: 4200,
            currency: "EUR".into(),
            due_at: Some(due),
            status: InvoiceStatus::Pending,
            payment_link: None,
        }
    }

    fn event(id: &str, t: EmailType, week: Option<u32>, dry_run: bool) -> EmailEvent {
        EmailEvent {
            id: id.into(),
            invoice_id: "inv-1".into(),
            tenant_id: "t-1".into(),
            email_type: t,
            week_number: week,
            created_at: Utc.with_ymd_and_hms(2026, 2, 20, 16, 0, 0).unwrap(),
            dry_run,
        }
    }

    fn window() -> CandidateQuery {
        let now = Utc.with_ymd_and_hms(2026, 2, 12, 0, 0, 0).unwrap();
        CandidateQuery {
            due_from: now - Duration::days(63),
            due_until: now + Duration::days(4),
            after: None,
            limit: 100,
        }
    }

    #[test]
    fn test_open_and_migrate() {
        let dir = std::env::temp_dir().join("chaser-db-test");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("open.db");
        {
            let db = ChaserDb::open(&path).unwrap();
            db.upsert_tenant("t-1", "Acme", Plan::Pro).unwrap();
        }
        // Re-opening runs the idempotent migrations again.
        let db = ChaserDb::open(&path).unwrap();
        assert_eq!(db.backfill().unwrap(), 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_invoice_roundtrip_and_window() {
        let db = ChaserDb::open_in_memory().unwrap();
        let due = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        db.upsert_invoice(&invoice("inv-1", due)).unwrap();
        db.upsert_invoice(&invoice("inv-old", due - Duration::days(90))).unwrap();

        let got = db.get_invoice("inv-1").await.unwrap().unwrap();
        assert_eq!(got.due_at, Some(due));
        assert_eq!(got.currency, "EUR");

        let page = db.candidates(&window()).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "inv-1");

        assert!(db.set_invoice_status("inv-1", InvoiceStatus::Paid).unwrap());
        assert!(db.candidates(&window()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_timestamp_shapes_are_normalized() {
        let db = ChaserDb::open_in_memory().unwrap();
        {
            let conn = db.conn();
            conn.execute_batch(
                r#"
                INSERT INTO invoices (id, tenant_id, customer_email, due_at, status)
                    VALUES ('a', 't-1', 'a@x.test', '2026-02-10', 'pending');
                INSERT INTO invoices (id, tenant_id, customer_email, due_at, status)
                    VALUES ('b', 't-1', 'b@x.test', 1770681600000, 'Pending');
                INSERT INTO invoices (id, tenant_id, customer_email, due_at, status)
                    VALUES ('c', 't-1', 'c@x.test', '{"_seconds":1770681600,"_nanoseconds":0}', 'pending');
                INSERT INTO invoices (id, tenant_id, customer_email, due_at, status)
                    VALUES ('d', 't-1', 'd@x.test', 'next tuesday', 'pending');
                "#,
            )
            .unwrap();
        }
        let page = db.candidates(&window()).await.unwrap();
        let ids: Vec<_> = page.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        let expected = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        assert!(page.iter().all(|i| i.due_at == Some(expected)));

        let broken = db.get_invoice("d").await.unwrap().unwrap();
        assert_eq!(broken.due_at, None);
    }

    #[tokio::test]
    async fn test_real_key_unique_dry_runs_free() {
        let db = ChaserDb::open_in_memory().unwrap();
        db.append(&event("e1", EmailType::LateWeekly, Some(1), true)).await.unwrap();
        db.append(&event("e2", EmailType::LateWeekly, Some(1), true)).await.unwrap();
        assert!(!db.has_event("inv-1", EmailType::LateWeekly, Some(1)).await.unwrap());

        db.append(&event("e3", EmailType::LateWeekly, Some(1), false)).await.unwrap();
        let dup = db.append(&event("e4", EmailType::LateWeekly, Some(1), false)).await;
        assert!(matches!(dup, Err(ChaseError::DuplicateEvent(_))));

        db.append(&event("e5", EmailType::LateWeekly, Some(2), false)).await.unwrap();
        assert!(db.has_event("inv-1", EmailType::LateWeekly, Some(2)).await.unwrap());
        assert!(!db.has_event("inv-1", EmailType::LateWeekly, Some(3)).await.unwrap());
        assert_eq!(db.count_sent("inv-1", EmailType::LateWeekly).await.unwrap(), 2);
        assert_eq!(db.events_for_invoice("inv-1").unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_tenant_history_counts_real_sends_since_day_start() {
        let db = ChaserDb::open_in_memory().unwrap();
        db.append(&event("e1", EmailType::Reminder, None, false)).await.unwrap();
        db.append(&event("e2", EmailType::Due, None, true)).await.unwrap();
        {
            let conn = db.conn();
            conn.execute(
                "INSERT INTO email_events (id, invoice_id, tenant_id, email_type, created_at)
                 VALUES ('ext', 'inv-9', 't-1', 'initial', '2026-02-19 08:00:00')",
                [],
            )
            .unwrap();
        }
        let day_start = Utc.with_ymd_and_hms(2026, 2, 20, 6, 0, 0).unwrap();
        let h = db.tenant_history("t-1", day_start).await.unwrap();
        assert_eq!(h.sent_today, 1);
        assert_eq!(
            h.last_sent_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 20, 16, 0, 0).unwrap())
        );
        assert!(db.has_event("inv-9", EmailType::Initial, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_legacy_weekly_tag_is_read_but_never_rewritten() {
        let db = ChaserDb::open_in_memory().unwrap();
        {
            let conn = db.conn();
            conn.execute_batch(
                "INSERT INTO email_events (id, invoice_id, tenant_id, email_type, week_number, created_at)
                     VALUES ('old', 'inv-bad', 't-1', 'lateWeekly', 1, '2026-02-20T16:00:00Z');
                 INSERT INTO email_events (id, invoice_id, tenant_id, email_type, week_number, created_at)
                     VALUES ('new', 'inv-bad', 't-1', 'late_weekly', 1, '2026-02-27T16:00:00Z');
                 INSERT INTO email_events (id, invoice_id, tenant_id, email_type, week_number, created_at)
                     VALUES ('solo', 'inv-2', 't-1', 'lateWeekly', 2, '2026-02-27T16:00:00Z');",
            )
            .unwrap();
        }

        // One invoice holding both spellings must not break reads for others.
        assert!(!db.has_event("inv-other", EmailType::Due, None).await.unwrap());
        assert!(db.candidates(&window()).await.unwrap().is_empty());
        let day_start = Utc.with_ymd_and_hms(2026, 2, 27, 6, 0, 0).unwrap();
        assert_eq!(db.tenant_history("t-1", day_start).await.unwrap().sent_today, 2);

        assert!(db.has_event("inv-2", EmailType::LateWeekly, Some(2)).await.unwrap());
        assert!(!db.has_event("inv-2", EmailType::LateWeekly, Some(1)).await.unwrap());
        assert_eq!(db.count_sent("inv-bad", EmailType::LateWeekly).await.unwrap(), 1);
        assert_eq!(db.count_sent("inv-2", EmailType::LateWeekly).await.unwrap(), 1);

        let stored: Vec<(String, String)> = {
            let conn = db.conn();
            let mut stmt = conn
                .prepare("SELECT id, email_type FROM email_events ORDER BY id")
                .unwrap();
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap()
        };
        assert_eq!(
            stored,
            [
                ("new".to_string(), "late_weekly".to_string()),
                ("old".to_string(), "lateWeekly".to_string()),
                ("solo".to_string(), "lateWeekly".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_backfill_failures_do_not_fail_reads() {
        let db = ChaserDb::open_in_memory().unwrap();
        {
            let conn = db.conn();
            conn.execute_batch(
                "INSERT INTO email_events (id, invoice_id, tenant_id, email_type, created_at)
                     VALUES ('stuck', 'inv-1', 't-1', 'reminder', '2026-02-20T16:00:00Z');
                 INSERT INTO email_events (id, invoice_id, tenant_id, email_type, created_at)
                     VALUES ('fine', 'inv-2', 't-1', 'due', '2026-02-20T17:00:00Z');
                 INSERT INTO email_events (id, invoice_id, tenant_id, email_type, created_at)
                     VALUES ('junk', 'inv-3', 't-1', 'due', 'not a time');
                 CREATE TRIGGER refuse_stuck BEFORE UPDATE OF created_epoch_ms ON email_events
                     WHEN old.id = 'stuck'
                 BEGIN SELECT RAISE(ABORT, 'row is read-only'); END;",
            )
            .unwrap();
        }

        let day_start = Utc.with_ymd_and_hms(2026, 2, 20, 6, 0, 0).unwrap();
        let h = db.tenant_history("t-1", day_start).await.unwrap();
        assert_eq!(h.sent_today, 1);
        assert_eq!(
            h.last_sent_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 20, 17, 0, 0).unwrap())
        );
        assert!(db.candidates(&window()).await.unwrap().is_empty());
        assert!(db.has_event("inv-1", EmailType::Reminder, None).await.unwrap());
        assert_eq!(db.backfill().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_tenant_is_trial() {
        let db = ChaserDb::open_in_memory().unwrap();
        assert_eq!(db.plan_for("nobody").await.unwrap(), Plan::Trial);
        db.upsert_tenant("t-2", "Beta", Plan::Business).unwrap();
        assert_eq!(db.plan_for("t-2").await.unwrap(), Plan::Business);
    }
}
