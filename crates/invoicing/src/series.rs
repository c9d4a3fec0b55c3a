use serde::{Deserialize, Serialize};

use numera_core::{DomainError, Entity, SeriesId, ValueObject};

/// Fiscal document class a series numbers (e.g. `FA` for a standard invoice).
///
/// Short uppercase alphanumeric code. Immutable per series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentType(String);

impl DocumentType {
    pub fn new(code: impl Into<String>) -> Result<Self, DomainError> {
        let code = code.into();
        if code.is_empty() || code.len() > 8 {
            return Err(DomainError::validation(
                "document type code must be 1..=8 characters",
            ));
        }
        if !code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
            return Err(DomainError::validation(
                "document type code must be uppercase ASCII alphanumeric",
            ));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for DocumentType {}

impl core::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An invoicing series: a named sequence of document numbers scoped to a
/// point-of-sale and document type.
///
/// `next_number` is the number the *next* emitted invoice will carry. It is
/// monotonically non-decreasing over the series' lifetime and only ever moves
/// by exactly 1 per committed invoice, always under the registry's exclusive
/// row lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub id: SeriesId,
    pub point_of_sale: u32,
    pub document_type: DocumentType,
    pub active: bool,
    next_number: i64,
}

impl Series {
    pub fn new(
        id: SeriesId,
        point_of_sale: u32,
        document_type: DocumentType,
        active: bool,
        next_number: i64,
    ) -> Result<Self, DomainError> {
        if point_of_sale == 0 {
            return Err(DomainError::validation("point_of_sale must be positive"));
        }
        if next_number < 1 {
            return Err(DomainError::validation("next_number must be positive"));
        }
        Ok(Self {
            id,
            point_of_sale,
            document_type,
            active,
            next_number,
        })
    }

    /// The number the next emitted invoice will carry.
    pub fn peek_number(&self) -> i64 {
        self.next_number
    }

    /// Consume the current number, moving the counter forward by exactly 1.
    ///
    /// Returns the number that was consumed. Callers must hold the series'
    /// exclusive lock for the whole read-modify-write.
    pub fn advance(&mut self) -> i64 {
        let assigned = self.next_number;
        self.next_number += 1;
        assigned
    }

    /// Whether this series may currently be drawn from.
    pub fn is_eligible(&self) -> bool {
        self.active
    }
}

impl Entity for Series {
    type Id = SeriesId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fa() -> DocumentType {
        DocumentType::new("FA").unwrap()
    }

    #[test]
    fn document_type_rejects_lowercase_and_empty() {
        assert!(DocumentType::new("fa").is_err());
        assert!(DocumentType::new("").is_err());
        assert!(DocumentType::new("TOOLONGCODE").is_err());
        assert_eq!(DocumentType::new("FA").unwrap().as_str(), "FA");
    }

    #[test]
    fn series_rejects_non_positive_fields() {
        assert!(Series::new(SeriesId::new(1), 0, fa(), true, 1).is_err());
        assert!(Series::new(SeriesId::new(1), 1, fa(), true, 0).is_err());
    }

    #[test]
    fn advance_consumes_current_number() {
        let mut series = Series::new(SeriesId::new(1), 1, fa(), true, 101).unwrap();
        assert_eq!(series.peek_number(), 101);
        assert_eq!(series.advance(), 101);
        assert_eq!(series.peek_number(), 102);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: any run of advances from any starting counter assigns a
        /// gap-free, strictly increasing, consecutive sequence of numbers.
        #[test]
        fn advances_assign_consecutive_numbers(
            start in 1i64..1_000_000i64,
            count in 1usize..500usize,
        ) {
            let mut series = Series::new(SeriesId::new(1), 1, fa(), true, start).unwrap();

            let assigned: Vec<i64> = (0..count).map(|_| series.advance()).collect();

            let expected: Vec<i64> = (start..start + count as i64).collect();
            prop_assert_eq!(assigned, expected);
            prop_assert_eq!(series.peek_number(), start + count as i64);
        }
    }
}
