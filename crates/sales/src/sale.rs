use serde::{Deserialize, Serialize};

use numera_core::{DomainError, Entity, SaleId};

/// A finalized sale as seen by the invoicing workflow.
///
/// Only the fields emission needs are modeled here; line items, payments and
/// the rest of the sale live in the surrounding system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sale {
    pub id: SaleId,
    /// Total in smallest currency unit (e.g., cents).
    pub total_cents: i64,
}

impl Sale {
    /// Build a finalized sale read model.
    ///
    /// A finalized sale never carries a negative total; refunds are separate
    /// documents in the surrounding system.
    pub fn new(id: SaleId, total_cents: i64) -> Result<Self, DomainError> {
        if total_cents < 0 {
            return Err(DomainError::validation("sale total must not be negative"));
        }
        Ok(Self { id, total_cents })
    }
}

impl Entity for Sale {
    type Id = SaleId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_sale_with_total() {
        let sale = Sale::new(SaleId::new(55), 100_000).unwrap();
        assert_eq!(sale.id, SaleId::new(55));
        assert_eq!(sale.total_cents, 100_000);
    }

    #[test]
    fn rejects_negative_total() {
        let err = Sale::new(SaleId::new(1), -1).unwrap_err();
        match err {
            DomainError::Validation(msg) if msg.contains("negative") => {}
            _ => panic!("expected validation error for negative total"),
        }
    }
}
