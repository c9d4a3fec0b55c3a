//! Postgres-backed invoice emission.
//!
//! The crux of this backend is step 3 of the workflow: the active series row
//! is selected `FOR UPDATE`, and that exclusive row lock is held until the
//! transaction ends. Without the lock across the read-modify-write of the
//! counter, two concurrent emissions could read the same `next_number` and
//! both attempt to use it. The lock serializes all emissions against one
//! series; numbers are therefore assigned in commit order, not call-arrival
//! order.
//!
//! ## Error mapping
//!
//! SQLx errors are mapped to `PersistenceError` as follows:
//!
//! | SQLSTATE | Meaning | PersistenceError |
//! |----------|---------|------------------|
//! | `23505` | unique violation | `ConstraintViolation` (or `AlreadyInvoiced` for the per-sale constraint) |
//! | `23503`, `23514` | FK / check violation | `ConstraintViolation` |
//! | `40001`, `40P01` | serialization failure / deadlock | `Conflict` |
//! | `55P03` | lock not available (lock_timeout) | `Timeout` |
//! | `57014` | statement canceled (statement_timeout) | `Timeout` |
//! | other | connection loss, pool closed, ... | `Storage` |

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use uuid::Uuid;

use async_trait::async_trait;
use tracing::instrument;

use numera_core::{
    CustomerId, EmitError, InvoiceId, PersistenceError, SaleId, SeriesId,
};
use numera_invoicing::{DocumentType, Invoice, InvoiceStatus, Series};
use numera_sales::Sale;

use crate::audit::{AuditRecord, AuditSink};
use crate::sale_store::SaleStore;

use super::r#trait::{
    InvoiceEmission, NewSeries, SeriesAdmin, SeriesAdminError, VoidError,
};

/// How long an emission waits on the series row before giving up.
///
/// Bounds the blocking in step 3 so a stuck lock holder surfaces as a
/// `Timeout` persistence failure instead of hanging callers forever.
const LOCK_TIMEOUT: &str = "5s";

/// Postgres-backed emission workflow.
///
/// Cloneable handle over a shared connection pool; safe to share across
/// request-handling tasks. The workflow itself performs no internal threading.
#[derive(Clone)]
pub struct PgEmission {
    pool: Arc<PgPool>,
    sales: Arc<dyn SaleStore>,
    audit: Arc<dyn AuditSink>,
}

impl PgEmission {
    pub fn new(pool: PgPool, sales: Arc<dyn SaleStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            pool: Arc::new(pool),
            sales,
            audit,
        }
    }

    /// Steps 2–6 of the workflow, inside an open transaction.
    ///
    /// Performs no commit or rollback itself; the caller owns the transaction
    /// boundary and resolves it based on the returned result.
    async fn emit_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        sale: &Sale,
        customer_id: CustomerId,
    ) -> Result<Invoice, EmitError> {
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}'", LOCK_TIMEOUT))
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        if PgInvoiceStore::find_by_sale(&mut **tx, sale.id)
            .await?
            .is_some()
        {
            return Err(EmitError::AlreadyInvoiced(sale.id));
        }

        let series = PgSeriesRegistry::lock_active_series(tx)
            .await?
            .ok_or(EmitError::NoActiveSeries)?;
        let number = series.peek_number();

        // Cannot fail for a row the registry just locked as active; treated
        // as a locking bug if it ever does.
        let invoice = Invoice::issue(&series, sale, customer_id, Utc::now())
            .map_err(|e| PersistenceError::Conflict(format!("emission invariant: {}", e)))?;

        PgInvoiceStore::insert(tx, &invoice).await?;
        PgSeriesRegistry::advance_counter(tx, series.id, number).await?;

        Ok(invoice)
    }

    async fn try_emit(
        &self,
        sale_id: SaleId,
        customer_id: CustomerId,
    ) -> Result<Invoice, EmitError> {
        // Step 1 is a read with no side effects; the sale store is an external
        // read-only collaborator, so it is consulted before the transaction
        // opens.
        let sale = self
            .sales
            .get(sale_id)
            .await
            .map_err(EmitError::from)?
            .ok_or(EmitError::SaleNotFound(sale_id))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EmitError::from(map_sqlx_error("begin", e)))?;

        match self.emit_in_tx(&mut tx, &sale, customer_id).await {
            Ok(invoice) => {
                // Step 7: the commit alone decides emission success.
                tx.commit()
                    .await
                    .map_err(|e| EmitError::from(map_sqlx_error("commit", e)))?;
                Ok(invoice)
            }
            Err(err) => {
                // Full rollback before the error is surfaced; partial state is
                // a correctness violation, not a degraded mode.
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(error = %rb, "rollback after failed emission also failed");
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl InvoiceEmission for PgEmission {
    #[instrument(skip(self), fields(sale_id = %sale_id, customer_id = %customer_id), err)]
    async fn emit(&self, sale_id: SaleId, customer_id: CustomerId) -> Result<Invoice, EmitError> {
        let result = self.try_emit(sale_id, customer_id).await;

        // Step 8: best-effort audit, outside the transaction. The sink's
        // infallible signature keeps it off the success/failure path.
        match &result {
            Ok(invoice) => self.audit.record(AuditRecord::emitted(invoice)),
            Err(err) => self.audit.record(AuditRecord::emit_failed(sale_id, err)),
        }

        result
    }

    #[instrument(skip(self), fields(sale_id = %sale_id), err)]
    async fn find_by_sale(&self, sale_id: SaleId) -> Result<Option<Invoice>, PersistenceError> {
        PgInvoiceStore::find_by_sale(&*self.pool, sale_id).await
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    async fn void(&self, invoice_id: InvoiceId) -> Result<Invoice, VoidError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let result: Result<Invoice, VoidError> = async {
            let mut invoice = PgInvoiceStore::lock_by_id(&mut tx, invoice_id)
                .await?
                .ok_or(VoidError::InvoiceNotFound(invoice_id))?;
            invoice.void()?;
            PgInvoiceStore::update_status(&mut tx, invoice_id, invoice.status).await?;
            Ok(invoice)
        }
        .await;

        match result {
            Ok(invoice) => {
                tx.commit()
                    .await
                    .map_err(|e| VoidError::from(map_sqlx_error("commit", e)))?;
                Ok(invoice)
            }
            Err(err) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(error = %rb, "rollback after failed void also failed");
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl SeriesAdmin for PgEmission {
    #[instrument(skip(self, new), fields(point_of_sale = new.point_of_sale), err)]
    async fn create_series(&self, new: NewSeries) -> Result<Series, SeriesAdminError> {
        let row = sqlx::query(
            r#"
            INSERT INTO invoice_series (point_of_sale, document_type, active, next_number)
            VALUES ($1, $2, $3, $4)
            RETURNING id, point_of_sale, document_type, active, next_number
            "#,
        )
        .bind(new.point_of_sale as i32)
        .bind(new.document_type.as_str())
        .bind(new.active)
        .bind(new.first_number)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_series", e))?;

        Ok(series_from_row(&row)?)
    }

    #[instrument(skip(self), fields(series_id = %series_id, active), err)]
    async fn set_active(
        &self,
        series_id: SeriesId,
        active: bool,
    ) -> Result<Series, SeriesAdminError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        // Same exclusive lock as emission: configuration changes serialize
        // against in-flight emissions instead of racing them.
        let locked = sqlx::query(
            r#"
            SELECT id, point_of_sale, document_type, active, next_number
            FROM invoice_series
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(series_id.as_i64())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_series", e))?;

        if locked.is_none() {
            if let Err(rb) = tx.rollback().await {
                tracing::warn!(error = %rb, "rollback after missing series also failed");
            }
            return Err(SeriesAdminError::SeriesNotFound(series_id));
        }

        let row = sqlx::query(
            r#"
            UPDATE invoice_series
            SET active = $2
            WHERE id = $1
            RETURNING id, point_of_sale, document_type, active, next_number
            "#,
        )
        .bind(series_id.as_i64())
        .bind(active)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("set_active", e))?;

        let series = series_from_row(&row)?;

        tx.commit()
            .await
            .map_err(|e| SeriesAdminError::from(map_sqlx_error("commit", e)))?;

        Ok(series)
    }

    async fn list_series(&self) -> Result<Vec<Series>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, point_of_sale, document_type, active, next_number
            FROM invoice_series
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_series", e))?;

        rows.iter().map(series_from_row).collect()
    }
}

/// Series row access under the emission transaction.
///
/// All counter mutations go through here, and only while the caller's
/// transaction holds the series row lock.
pub struct PgSeriesRegistry;

impl PgSeriesRegistry {
    /// Step 3: select the active series with an exclusive row lock held until
    /// transaction end. Deterministic lowest-id pick when several rows are
    /// active (a configuration smell the system does not try to resolve
    /// cleverly).
    pub async fn lock_active_series(
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<Option<Series>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT id, point_of_sale, document_type, active, next_number
            FROM invoice_series
            WHERE active
            ORDER BY id ASC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_active_series", e))?;

        row.as_ref().map(series_from_row).transpose()
    }

    /// Step 6: advance the counter by exactly 1, write-conditioned on the row
    /// still holding the captured value. A mismatch under the row lock can
    /// only mean a lock-scope bug, so it surfaces as a conflict instead of
    /// being swallowed.
    pub async fn advance_counter(
        tx: &mut Transaction<'_, Postgres>,
        series_id: SeriesId,
        expected_number: i64,
    ) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE invoice_series
            SET next_number = next_number + 1
            WHERE id = $1 AND next_number = $2
            "#,
        )
        .bind(series_id.as_i64())
        .bind(expected_number)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("advance_counter", e))?;

        if result.rows_affected() != 1 {
            return Err(PersistenceError::Conflict(format!(
                "series {} counter moved while locked (expected {})",
                series_id, expected_number
            )));
        }
        Ok(())
    }
}

/// Invoice row access.
pub struct PgInvoiceStore;

impl PgInvoiceStore {
    pub async fn find_by_sale<'e, E>(
        executor: E,
        sale_id: SaleId,
    ) -> Result<Option<Invoice>, PersistenceError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let row = sqlx::query(
            r#"
            SELECT id, sale_id, series_id, number, customer_id, total_cents, status, issued_at
            FROM invoices
            WHERE sale_id = $1
            "#,
        )
        .bind(sale_id.as_i64())
        .fetch_optional(executor)
        .await
        .map_err(|e| map_sqlx_error("find_by_sale", e))?;

        row.as_ref().map(invoice_from_row).transpose()
    }

    async fn lock_by_id(
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: InvoiceId,
    ) -> Result<Option<Invoice>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT id, sale_id, series_id, number, customer_id, total_cents, status, issued_at
            FROM invoices
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(invoice_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_invoice", e))?;

        row.as_ref().map(invoice_from_row).transpose()
    }

    /// Step 5: insert the invoice row.
    ///
    /// The per-sale unique constraint catches a same-sale race that slipped
    /// past the step-2 check; the corrective action for the caller is the
    /// same, so it surfaces as `AlreadyInvoiced`. A `(series_id, number)`
    /// violation should be impossible under the row lock and stays a
    /// persistence failure, never a silent retry with a different number.
    pub async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        invoice: &Invoice,
    ) -> Result<(), EmitError> {
        sqlx::query(
            r#"
            INSERT INTO invoices
                (id, sale_id, series_id, number, customer_id, total_cents, status, issued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(invoice.id.as_uuid())
        .bind(invoice.sale_id.as_i64())
        .bind(invoice.series_id.as_i64())
        .bind(invoice.number)
        .bind(invoice.customer_id.as_i64())
        .bind(invoice.total_cents)
        .bind(status_str(invoice.status))
        .bind(invoice.issued_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.code().as_deref() == Some("23505")
                    && db_err.constraint() == Some("invoices_sale_id_key")
                {
                    return EmitError::AlreadyInvoiced(invoice.sale_id);
                }
            }
            EmitError::from(map_sqlx_error("insert_invoice", e))
        })?;

        Ok(())
    }

    async fn update_status(
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: InvoiceId,
        status: InvoiceStatus,
    ) -> Result<(), PersistenceError> {
        let result = sqlx::query("UPDATE invoices SET status = $2 WHERE id = $1")
            .bind(invoice_id.as_uuid())
            .bind(status_str(status))
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("update_status", e))?;

        if result.rows_affected() != 1 {
            return Err(PersistenceError::Storage(format!(
                "invoice {} vanished while locked",
                invoice_id
            )));
        }
        Ok(())
    }
}

/// Create the emission tables if they do not exist.
///
/// Fixed schema: no runtime shape detection, no compatibility branching. The
/// unique constraints back the step-5 defense and the at-most-one-invoice-
/// per-sale guarantee; constraint names are load-bearing (error mapping keys
/// off `invoices_sale_id_key`).
pub async fn ensure_schema(pool: &PgPool) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS invoice_series (
            id BIGSERIAL PRIMARY KEY,
            point_of_sale INTEGER NOT NULL CHECK (point_of_sale > 0),
            document_type TEXT NOT NULL,
            active BOOLEAN NOT NULL DEFAULT FALSE,
            next_number BIGINT NOT NULL CHECK (next_number > 0),
            CONSTRAINT invoice_series_pos_doc_key UNIQUE (point_of_sale, document_type)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| map_sqlx_error("ensure_schema", e))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS invoices (
            id UUID PRIMARY KEY,
            sale_id BIGINT NOT NULL,
            series_id BIGINT NOT NULL REFERENCES invoice_series (id),
            number BIGINT NOT NULL,
            customer_id BIGINT NOT NULL,
            total_cents BIGINT NOT NULL,
            status TEXT NOT NULL,
            issued_at TIMESTAMPTZ NOT NULL,
            CONSTRAINT invoices_sale_id_key UNIQUE (sale_id),
            CONSTRAINT invoices_series_number_key UNIQUE (series_id, number)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| map_sqlx_error("ensure_schema", e))?;

    Ok(())
}

fn status_str(status: InvoiceStatus) -> &'static str {
    match status {
        InvoiceStatus::Issued => "issued",
        InvoiceStatus::Voided => "voided",
    }
}

fn series_from_row(row: &PgRow) -> Result<Series, PersistenceError> {
    let id: i64 = row
        .try_get("id")
        .map_err(|e| corrupt_row("invoice_series", e))?;
    let point_of_sale: i32 = row
        .try_get("point_of_sale")
        .map_err(|e| corrupt_row("invoice_series", e))?;
    let document_type: String = row
        .try_get("document_type")
        .map_err(|e| corrupt_row("invoice_series", e))?;
    let active: bool = row
        .try_get("active")
        .map_err(|e| corrupt_row("invoice_series", e))?;
    let next_number: i64 = row
        .try_get("next_number")
        .map_err(|e| corrupt_row("invoice_series", e))?;

    let document_type = DocumentType::new(document_type)
        .map_err(|e| PersistenceError::Storage(format!("corrupt invoice_series row {}: {}", id, e)))?;
    Series::new(
        SeriesId::new(id),
        point_of_sale as u32,
        document_type,
        active,
        next_number,
    )
    .map_err(|e| PersistenceError::Storage(format!("corrupt invoice_series row {}: {}", id, e)))
}

fn invoice_from_row(row: &PgRow) -> Result<Invoice, PersistenceError> {
    let id: Uuid = row.try_get("id").map_err(|e| corrupt_row("invoices", e))?;
    let sale_id: i64 = row
        .try_get("sale_id")
        .map_err(|e| corrupt_row("invoices", e))?;
    let series_id: i64 = row
        .try_get("series_id")
        .map_err(|e| corrupt_row("invoices", e))?;
    let number: i64 = row
        .try_get("number")
        .map_err(|e| corrupt_row("invoices", e))?;
    let customer_id: i64 = row
        .try_get("customer_id")
        .map_err(|e| corrupt_row("invoices", e))?;
    let total_cents: i64 = row
        .try_get("total_cents")
        .map_err(|e| corrupt_row("invoices", e))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| corrupt_row("invoices", e))?;
    let issued_at: DateTime<Utc> = row
        .try_get("issued_at")
        .map_err(|e| corrupt_row("invoices", e))?;

    let status = match status.as_str() {
        "issued" => InvoiceStatus::Issued,
        "voided" => InvoiceStatus::Voided,
        other => {
            return Err(PersistenceError::Storage(format!(
                "corrupt invoices row {}: unknown status '{}'",
                id, other
            )))
        }
    };

    Ok(Invoice {
        id: InvoiceId::from_uuid(id),
        sale_id: SaleId::new(sale_id),
        series_id: SeriesId::new(series_id),
        number,
        customer_id: CustomerId::new(customer_id),
        total_cents,
        status,
        issued_at,
    })
}

fn corrupt_row(table: &str, err: sqlx::Error) -> PersistenceError {
    PersistenceError::Storage(format!("failed to decode {} row: {}", table, err))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("23505") | Some("23503") | Some("23514") => {
                    PersistenceError::ConstraintViolation(msg)
                }
                Some("40001") | Some("40P01") => PersistenceError::Conflict(msg),
                Some("55P03") | Some("57014") => PersistenceError::Timeout(msg),
                _ => PersistenceError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            PersistenceError::Timeout(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            PersistenceError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => PersistenceError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
