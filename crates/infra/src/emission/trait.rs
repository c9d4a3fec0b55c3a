use async_trait::async_trait;
use thiserror::Error;

use numera_core::{
    CustomerId, DomainError, EmitError, InvoiceId, PersistenceError, SaleId, SeriesId,
};
use numera_invoicing::{DocumentType, Invoice, Series};

/// Transactional emission of fiscal invoices.
///
/// `emit` is the one operation where correctness under concurrent access
/// matters: implementations must guarantee that for a given series no number
/// is ever issued twice and no number is consumed without its invoice, even
/// when arbitrarily many `emit` calls race. See the backend modules for how
/// each achieves that.
#[async_trait]
pub trait InvoiceEmission: Send + Sync {
    /// Allocate the next number of the active series to `sale_id` and create
    /// the invoice, all in one atomic transaction.
    ///
    /// Blind retry after a `Persistence` failure with unknown commit status is
    /// not safe; callers should re-check via [`find_by_sale`] first (a rolled
    /// back attempt leaves no trace, so retry after that is fine).
    ///
    /// [`find_by_sale`]: InvoiceEmission::find_by_sale
    async fn emit(&self, sale_id: SaleId, customer_id: CustomerId) -> Result<Invoice, EmitError>;

    /// Look up the invoice issued for a sale, if any.
    async fn find_by_sale(&self, sale_id: SaleId) -> Result<Option<Invoice>, PersistenceError>;

    /// Mark an issued invoice void. Its `(series, number)` pair stays
    /// consumed; no counter moves.
    async fn void(&self, invoice_id: InvoiceId) -> Result<Invoice, VoidError>;
}

/// Series configuration.
///
/// Mutations go through the same locking primitive as emission so that
/// configuration changes serialize against in-flight emissions instead of
/// racing them.
#[async_trait]
pub trait SeriesAdmin: Send + Sync {
    async fn create_series(&self, new: NewSeries) -> Result<Series, SeriesAdminError>;

    async fn set_active(
        &self,
        series_id: SeriesId,
        active: bool,
    ) -> Result<Series, SeriesAdminError>;

    async fn list_series(&self) -> Result<Vec<Series>, PersistenceError>;
}

/// Validated payload for creating a series; the backend assigns the id.
#[derive(Debug, Clone)]
pub struct NewSeries {
    pub point_of_sale: u32,
    pub document_type: DocumentType,
    pub active: bool,
    pub first_number: i64,
}

impl NewSeries {
    pub fn new(
        point_of_sale: u32,
        document_type: DocumentType,
        active: bool,
        first_number: i64,
    ) -> Result<Self, DomainError> {
        if point_of_sale == 0 {
            return Err(DomainError::validation("point_of_sale must be positive"));
        }
        if first_number < 1 {
            return Err(DomainError::validation("first_number must be positive"));
        }
        Ok(Self {
            point_of_sale,
            document_type,
            active,
            first_number,
        })
    }
}

/// Failure of a void operation.
#[derive(Debug, Error)]
pub enum VoidError {
    #[error("invoice not found: {0}")]
    InvoiceNotFound(InvoiceId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Failure of a series configuration operation.
#[derive(Debug, Error)]
pub enum SeriesAdminError {
    #[error("series not found: {0}")]
    SeriesNotFound(SeriesId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
