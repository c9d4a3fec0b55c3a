//! Best-effort audit trail boundary.
//!
//! The audit sink is a **one-way notification**, not a call the emitter awaits
//! for correctness: emission success is determined solely by the transaction
//! commit, and a sink that cannot deliver must log and move on. The infallible
//! `record` signature makes it impossible for a sink failure to leak back into
//! the workflow.

use serde::Serialize;
use serde_json::json;
use std::sync::Mutex;

use numera_core::{EmitError, SaleId};
use numera_invoicing::Invoice;

/// Outcome of the audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// One audit-trail entry describing an emission outcome.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub action: &'static str,
    pub entity: &'static str,
    pub entity_id: String,
    pub metadata: serde_json::Value,
    pub outcome: AuditOutcome,
}

impl AuditRecord {
    /// Record for a committed emission.
    pub fn emitted(invoice: &Invoice) -> Self {
        Self {
            action: "invoice.emit",
            entity: "invoice",
            entity_id: invoice.id.to_string(),
            metadata: json!({
                "sale_id": invoice.sale_id,
                "series_id": invoice.series_id,
                "number": invoice.number,
                "customer_id": invoice.customer_id,
                "total_cents": invoice.total_cents,
            }),
            outcome: AuditOutcome::Success,
        }
    }

    /// Record for a failed emission attempt (no invoice was created).
    pub fn emit_failed(sale_id: SaleId, err: &EmitError) -> Self {
        Self {
            action: "invoice.emit",
            entity: "invoice",
            entity_id: sale_id.to_string(),
            metadata: json!({
                "sale_id": sale_id,
                "error": err.to_string(),
            }),
            outcome: AuditOutcome::Failure,
        }
    }
}

/// Fire-and-forget audit sink.
///
/// Implementations must not block the caller on delivery and must swallow
/// their own failures (logging them is fine, propagating them is not).
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Sink that writes audit records to the tracing subscriber.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    pub fn new() -> Self {
        Self
    }
}

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        tracing::info!(
            action = record.action,
            entity = record.entity,
            entity_id = %record.entity_id,
            outcome = ?record.outcome,
            metadata = %record.metadata,
            "audit"
        );
    }
}

/// In-memory sink capturing records for assertions.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        } else {
            tracing::warn!("audit sink lock poisoned; dropping record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use numera_core::{CustomerId, SeriesId};
    use numera_invoicing::{DocumentType, Series};
    use numera_sales::Sale;

    fn test_invoice() -> Invoice {
        let series = Series::new(
            SeriesId::new(1),
            1,
            DocumentType::new("FA").unwrap(),
            true,
            101,
        )
        .unwrap();
        let sale = Sale::new(SaleId::new(55), 100_000).unwrap();
        Invoice::issue(&series, &sale, CustomerId::new(9), Utc::now()).unwrap()
    }

    #[test]
    fn in_memory_sink_captures_records() {
        let sink = InMemoryAuditSink::new();
        sink.record(AuditRecord::emitted(&test_invoice()));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "invoice.emit");
        assert_eq!(records[0].entity, "invoice");
        assert_eq!(records[0].outcome, AuditOutcome::Success);
        assert_eq!(records[0].metadata["number"], 101);
    }

    #[test]
    fn failure_record_carries_error_text() {
        let sale_id = SaleId::new(55);
        let record = AuditRecord::emit_failed(sale_id, &EmitError::AlreadyInvoiced(sale_id));
        assert_eq!(record.outcome, AuditOutcome::Failure);
        assert!(record.metadata["error"]
            .as_str()
            .unwrap()
            .contains("already invoiced"));
    }
}
