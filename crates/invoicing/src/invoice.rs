use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use numera_core::{CustomerId, DomainError, Entity, InvoiceId, SaleId, SeriesId};
use numera_sales::Sale;

use crate::series::Series;

/// Invoice status lifecycle.
///
/// A voided invoice keeps its `(series, number)` pair forever; numbers are
/// never reused, including for voided documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Issued,
    Voided,
}

/// A fiscal invoice issued against a sale.
///
/// `sale_id` is unique across all invoices (a sale is invoiced at most once);
/// `(series_id, number)` is globally unique and never reused. Both are
/// enforced by the store, the types here only carry the values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub sale_id: SaleId,
    pub series_id: SeriesId,
    pub number: i64,
    pub customer_id: CustomerId,
    /// Total in smallest currency unit, copied from the sale at emission time.
    pub total_cents: i64,
    pub status: InvoiceStatus,
    pub issued_at: DateTime<Utc>,
}

impl Invoice {
    /// Build the invoice for `sale` using the number currently at the head of
    /// `series`.
    ///
    /// This captures the counter value; it does not advance it. The emission
    /// workflow advances the series in the same transaction that persists the
    /// returned invoice, so the two can only succeed or fail together.
    pub fn issue(
        series: &Series,
        sale: &Sale,
        customer_id: CustomerId,
        issued_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if !series.is_eligible() {
            return Err(DomainError::invariant(
                "cannot issue against an inactive series",
            ));
        }
        Ok(Self {
            id: InvoiceId::new(),
            sale_id: sale.id,
            series_id: series.id,
            number: series.peek_number(),
            customer_id,
            total_cents: sale.total_cents,
            status: InvoiceStatus::Issued,
            issued_at,
        })
    }

    /// Mark the invoice void. The assigned number stays consumed.
    pub fn void(&mut self) -> Result<(), DomainError> {
        if self.status == InvoiceStatus::Voided {
            return Err(DomainError::conflict("invoice is already void"));
        }
        self.status = InvoiceStatus::Voided;
        Ok(())
    }
}

impl Entity for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::DocumentType;

    fn test_series(next_number: i64) -> Series {
        Series::new(
            SeriesId::new(1),
            1,
            DocumentType::new("FA").unwrap(),
            true,
            next_number,
        )
        .unwrap()
    }

    fn test_sale() -> Sale {
        Sale::new(SaleId::new(55), 100_000).unwrap()
    }

    #[test]
    fn issue_captures_series_number_and_sale_total() {
        let series = test_series(101);
        let sale = test_sale();
        let now = Utc::now();

        let invoice = Invoice::issue(&series, &sale, CustomerId::new(9), now).unwrap();

        assert_eq!(invoice.sale_id, SaleId::new(55));
        assert_eq!(invoice.series_id, SeriesId::new(1));
        assert_eq!(invoice.number, 101);
        assert_eq!(invoice.customer_id, CustomerId::new(9));
        assert_eq!(invoice.total_cents, 100_000);
        assert_eq!(invoice.status, InvoiceStatus::Issued);
        assert_eq!(invoice.issued_at, now);
        // Issuing does not move the counter; that happens in the same
        // transaction as the insert, in the emission workflow.
        assert_eq!(series.peek_number(), 101);
    }

    #[test]
    fn issue_refuses_inactive_series() {
        let mut series = test_series(101);
        series.active = false;

        let err =
            Invoice::issue(&series, &test_sale(), CustomerId::new(9), Utc::now()).unwrap_err();
        match err {
            DomainError::InvariantViolation(msg) if msg.contains("inactive series") => {}
            _ => panic!("expected invariant violation for inactive series"),
        }
    }

    #[test]
    fn void_is_not_repeatable() {
        let series = test_series(101);
        let mut invoice =
            Invoice::issue(&series, &test_sale(), CustomerId::new(9), Utc::now()).unwrap();

        invoice.void().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Voided);
        // The number stays consumed on the voided document.
        assert_eq!(invoice.number, 101);

        let err = invoice.void().unwrap_err();
        match err {
            DomainError::Conflict(msg) if msg.contains("already void") => {}
            _ => panic!("expected conflict for double void"),
        }
    }
}
