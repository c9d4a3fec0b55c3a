//! In-memory invoice emission.
//!
//! Intended for tests/dev. One mutex over the whole emission state plays the
//! role of the Postgres row lock: holding it across the read-modify-write of
//! the counter serializes emissions exactly like `FOR UPDATE` does. Writes are
//! staged and applied at a single commit point, so any failure before that
//! point leaves no trace, the same all-or-nothing property the transactional
//! backend gets from rollback.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use numera_core::{
    CustomerId, EmitError, InvoiceId, PersistenceError, SaleId, SeriesId,
};
use numera_invoicing::{Invoice, Series};

use crate::audit::{AuditRecord, AuditSink};
use crate::sale_store::SaleStore;

use super::r#trait::{
    InvoiceEmission, NewSeries, SeriesAdmin, SeriesAdminError, VoidError,
};

/// Storage fault simulation points.
///
/// Used by tests to verify the atomicity property: a failure injected after
/// the invoice insert but before the counter advance must leave zero invoice
/// rows and zero counter change behind.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailurePoint {
    /// Fail as if storage broke between steps 5 and 6 of the workflow.
    BeforeCounterAdvance,
}

#[derive(Debug, Default)]
struct EmissionState {
    series: BTreeMap<SeriesId, Series>,
    invoices: HashMap<InvoiceId, Invoice>,
    invoice_by_sale: HashMap<SaleId, InvoiceId>,
    consumed_numbers: HashSet<(SeriesId, i64)>,
    next_series_id: i64,
}

impl EmissionState {
    /// Lowest-id active series, cloned as of "lock" time. The caller holds
    /// the state mutex, which is what makes this a lock and not a peek.
    fn lock_active_series(&self) -> Option<Series> {
        self.series.values().find(|s| s.is_eligible()).cloned()
    }

    fn find_by_sale(&self, sale_id: SaleId) -> Option<&Invoice> {
        self.invoice_by_sale
            .get(&sale_id)
            .and_then(|id| self.invoices.get(id))
    }

    /// Conditional counter advance, mirroring the write-conditioned UPDATE.
    fn advance_counter(
        &mut self,
        series_id: SeriesId,
        expected_number: i64,
    ) -> Result<(), PersistenceError> {
        let series = self.series.get_mut(&series_id).ok_or_else(|| {
            PersistenceError::Storage(format!("series {} vanished while locked", series_id))
        })?;
        if series.peek_number() != expected_number {
            return Err(PersistenceError::Conflict(format!(
                "series {} counter moved while locked (expected {})",
                series_id, expected_number
            )));
        }
        series.advance();
        Ok(())
    }

    /// Commit point: insert the invoice and advance the counter together.
    /// Nothing before this call has mutated the state.
    fn apply_emission(&mut self, invoice: Invoice, expected_number: i64) -> Result<(), EmitError> {
        let key = (invoice.series_id, invoice.number);
        if self.consumed_numbers.contains(&key) {
            // Impossible while the state mutex is held; defended against
            // anyway, and never silently retried with a different number.
            return Err(PersistenceError::ConstraintViolation(format!(
                "number {} already consumed on series {}",
                invoice.number, invoice.series_id
            ))
            .into());
        }
        if self.invoice_by_sale.contains_key(&invoice.sale_id) {
            return Err(EmitError::AlreadyInvoiced(invoice.sale_id));
        }

        self.advance_counter(invoice.series_id, expected_number)?;
        self.consumed_numbers.insert(key);
        self.invoice_by_sale.insert(invoice.sale_id, invoice.id);
        self.invoices.insert(invoice.id, invoice);
        Ok(())
    }
}

/// In-memory emission workflow.
pub struct InMemoryEmission {
    state: Mutex<EmissionState>,
    fail_next: Mutex<Option<FailurePoint>>,
    sales: Arc<dyn SaleStore>,
    audit: Arc<dyn AuditSink>,
}

impl InMemoryEmission {
    pub fn new(sales: Arc<dyn SaleStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            state: Mutex::new(EmissionState::default()),
            fail_next: Mutex::new(None),
            sales,
            audit,
        }
    }

    /// Arm a one-shot storage fault for the next emission.
    pub fn fail_next(&self, point: FailurePoint) {
        if let Ok(mut fault) = self.fail_next.lock() {
            *fault = Some(point);
        }
    }

    fn take_fault(&self, point: FailurePoint) -> bool {
        match self.fail_next.lock() {
            Ok(mut fault) if *fault == Some(point) => {
                *fault = None;
                true
            }
            _ => false,
        }
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, EmissionState>, PersistenceError> {
        self.state
            .lock()
            .map_err(|_| PersistenceError::Storage("emission state lock poisoned".to_string()))
    }

    async fn try_emit(
        &self,
        sale_id: SaleId,
        customer_id: CustomerId,
    ) -> Result<Invoice, EmitError> {
        // Step 1: read-only external lookup, before the critical section.
        let sale = self
            .sales
            .get(sale_id)
            .await
            .map_err(EmitError::from)?
            .ok_or(EmitError::SaleNotFound(sale_id))?;

        // Steps 2-7 under the state mutex (the row-lock stand-in).
        let mut state = self.lock_state()?;

        if state.find_by_sale(sale_id).is_some() {
            return Err(EmitError::AlreadyInvoiced(sale_id));
        }

        let series = state.lock_active_series().ok_or(EmitError::NoActiveSeries)?;
        let number = series.peek_number();

        let invoice = Invoice::issue(&series, &sale, customer_id, Utc::now())
            .map_err(|e| PersistenceError::Conflict(format!("emission invariant: {}", e)))?;

        if self.take_fault(FailurePoint::BeforeCounterAdvance) {
            // Staged writes are discarded wholesale, like a rollback.
            return Err(PersistenceError::Storage(
                "injected storage failure before counter advance".to_string(),
            )
            .into());
        }

        state.apply_emission(invoice.clone(), number)?;
        Ok(invoice)
    }
}

#[async_trait]
impl InvoiceEmission for InMemoryEmission {
    async fn emit(&self, sale_id: SaleId, customer_id: CustomerId) -> Result<Invoice, EmitError> {
        let result = self.try_emit(sale_id, customer_id).await;

        // Best-effort audit of the outcome; never feeds back into the result.
        match &result {
            Ok(invoice) => self.audit.record(AuditRecord::emitted(invoice)),
            Err(err) => self.audit.record(AuditRecord::emit_failed(sale_id, err)),
        }

        result
    }

    async fn find_by_sale(&self, sale_id: SaleId) -> Result<Option<Invoice>, PersistenceError> {
        let state = self.lock_state()?;
        Ok(state.find_by_sale(sale_id).cloned())
    }

    async fn void(&self, invoice_id: InvoiceId) -> Result<Invoice, VoidError> {
        let mut state = self.lock_state()?;
        let invoice = state
            .invoices
            .get_mut(&invoice_id)
            .ok_or(VoidError::InvoiceNotFound(invoice_id))?;
        invoice.void()?;
        Ok(invoice.clone())
    }
}

#[async_trait]
impl SeriesAdmin for InMemoryEmission {
    async fn create_series(&self, new: NewSeries) -> Result<Series, SeriesAdminError> {
        let mut state = self.lock_state()?;
        state.next_series_id += 1;
        let id = SeriesId::new(state.next_series_id);
        let series = Series::new(
            id,
            new.point_of_sale,
            new.document_type,
            new.active,
            new.first_number,
        )?;
        state.series.insert(id, series.clone());
        Ok(series)
    }

    async fn set_active(
        &self,
        series_id: SeriesId,
        active: bool,
    ) -> Result<Series, SeriesAdminError> {
        // Same lock as emission: configuration changes serialize against
        // in-flight emissions.
        let mut state = self.lock_state()?;
        let series = state
            .series
            .get_mut(&series_id)
            .ok_or(SeriesAdminError::SeriesNotFound(series_id))?;
        series.active = active;
        Ok(series.clone())
    }

    async fn list_series(&self) -> Result<Vec<Series>, PersistenceError> {
        let state = self.lock_state()?;
        Ok(state.series.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::sale_store::InMemorySaleStore;
    use numera_invoicing::DocumentType;
    use numera_sales::Sale;

    fn setup() -> (Arc<InMemorySaleStore>, Arc<InMemoryAuditSink>, InMemoryEmission) {
        let sales = Arc::new(InMemorySaleStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let emission = InMemoryEmission::new(sales.clone(), audit.clone());
        (sales, audit, emission)
    }

    fn fa_series(first_number: i64, active: bool) -> NewSeries {
        NewSeries::new(1, DocumentType::new("FA").unwrap(), active, first_number).unwrap()
    }

    #[tokio::test]
    async fn emit_assigns_head_number_and_advances_counter() {
        let (sales, _, emission) = setup();
        sales.insert(Sale::new(SaleId::new(55), 100_000).unwrap());
        let series = emission.create_series(fa_series(101, true)).await.unwrap();

        let invoice = emission
            .emit(SaleId::new(55), CustomerId::new(9))
            .await
            .unwrap();

        assert_eq!(invoice.sale_id, SaleId::new(55));
        assert_eq!(invoice.series_id, series.id);
        assert_eq!(invoice.number, 101);
        assert_eq!(invoice.total_cents, 100_000);

        let after = emission.list_series().await.unwrap();
        assert_eq!(after[0].peek_number(), 102);
    }

    #[tokio::test]
    async fn emit_fails_without_sale_and_writes_nothing() {
        let (_, _, emission) = setup();
        emission.create_series(fa_series(101, true)).await.unwrap();

        let err = emission
            .emit(SaleId::new(404), CustomerId::new(9))
            .await
            .unwrap_err();
        assert!(matches!(err, EmitError::SaleNotFound(id) if id == SaleId::new(404)));

        let series = emission.list_series().await.unwrap();
        assert_eq!(series[0].peek_number(), 101);
    }

    #[tokio::test]
    async fn lowest_id_series_wins_when_several_are_active() {
        let (sales, _, emission) = setup();
        sales.insert(Sale::new(SaleId::new(1), 500).unwrap());
        let first = emission.create_series(fa_series(10, true)).await.unwrap();
        let second = emission
            .create_series(
                NewSeries::new(2, DocumentType::new("FA").unwrap(), true, 900).unwrap(),
            )
            .await
            .unwrap();
        assert!(first.id < second.id);

        let invoice = emission
            .emit(SaleId::new(1), CustomerId::new(9))
            .await
            .unwrap();
        assert_eq!(invoice.series_id, first.id);
        assert_eq!(invoice.number, 10);
    }

    #[tokio::test]
    async fn inactive_series_is_not_eligible() {
        let (sales, _, emission) = setup();
        sales.insert(Sale::new(SaleId::new(1), 500).unwrap());
        emission.create_series(fa_series(10, false)).await.unwrap();

        let err = emission
            .emit(SaleId::new(1), CustomerId::new(9))
            .await
            .unwrap_err();
        assert!(matches!(err, EmitError::NoActiveSeries));
    }

    #[tokio::test]
    async fn set_active_enables_emission() {
        let (sales, _, emission) = setup();
        sales.insert(Sale::new(SaleId::new(1), 500).unwrap());
        let series = emission.create_series(fa_series(10, false)).await.unwrap();

        emission.set_active(series.id, true).await.unwrap();

        let invoice = emission
            .emit(SaleId::new(1), CustomerId::new(9))
            .await
            .unwrap();
        assert_eq!(invoice.number, 10);
    }

    #[tokio::test]
    async fn void_keeps_the_number_consumed() {
        let (sales, _, emission) = setup();
        sales.insert(Sale::new(SaleId::new(1), 500).unwrap());
        sales.insert(Sale::new(SaleId::new(2), 700).unwrap());
        emission.create_series(fa_series(10, true)).await.unwrap();

        let invoice = emission
            .emit(SaleId::new(1), CustomerId::new(9))
            .await
            .unwrap();
        let voided = emission.void(invoice.id).await.unwrap();
        assert_eq!(voided.status, numera_invoicing::InvoiceStatus::Voided);

        // The next emission still gets the next number, not the voided one.
        let next = emission
            .emit(SaleId::new(2), CustomerId::new(9))
            .await
            .unwrap();
        assert_eq!(next.number, 11);

        let err = emission.void(invoice.id).await.unwrap_err();
        assert!(matches!(err, VoidError::Domain(_)));
    }

    #[tokio::test]
    async fn void_of_unknown_invoice_fails() {
        let (_, _, emission) = setup();
        let err = emission.void(InvoiceId::new()).await.unwrap_err();
        assert!(matches!(err, VoidError::InvoiceNotFound(_)));
    }
}
