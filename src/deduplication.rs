// 🔍 Duplicate Detector - suppress re-imported transactions
//
// A fingerprint is SHA-256 over a fixed field subset (date, amount, normalized
// description, account key). Identity keys are NOT part of it: the same bank
// line imported twice gets two fresh ids but one fingerprint.
//
// Matching is exact on normalized fields. Duplicates are skipped and counted,
// never merged into the existing record.

use crate::entities::Transaction;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

// ============================================================================
// FINGERPRINT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(tx: &Transaction) -> Self {
        Self::from_parts(tx.date, tx.amount, &tx.description, &tx.account.id)
    }

    /// Fields are hashed in a fixed canonical order, independent of how the
    /// caller assembled the record.
    pub fn from_parts(date: NaiveDate, amount: f64, description: &str, account_key: &str) -> Self {
        let canonical = format!(
            "date={}|amount={}|description={}|account={}",
            date.format("%Y-%m-%d"),
            amount_in_cents(amount),
            normalize_text(description),
            normalize_text(account_key),
        );

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    /// Wrap a value read back from the store's fingerprint column
    pub fn from_stored(value: String) -> Self {
        Fingerprint(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase and collapse all whitespace runs to one space
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Amounts compare at cent precision so 100 and 100.0000001 collide
fn amount_in_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// Exact-match duplicate check against a fingerprint set
pub fn is_duplicate(candidate: &Transaction, against: &HashSet<Fingerprint>) -> bool {
    against.contains(&Fingerprint::of(candidate))
}

// ============================================================================
// DUPLICATE DETECTOR
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedDuplicate {
    /// Position in the candidate batch
    pub index: usize,
    pub id: String,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone)]
pub struct DedupOutcome {
    pub accepted: Vec<Transaction>,
    pub skipped: Vec<SkippedDuplicate>,
}

impl DedupOutcome {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

/// Tracks known fingerprints across one import.
///
/// Accepted candidates are added to the known set, so a batch that repeats a
/// line against itself is also caught.
#[derive(Debug, Default)]
pub struct DuplicateDetector {
    known: HashSet<Fingerprint>,
    skipped_total: usize,
}

impl DuplicateDetector {
    pub fn new(existing: HashSet<Fingerprint>) -> Self {
        DuplicateDetector {
            known: existing,
            skipped_total: 0,
        }
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped_total
    }

    /// Check one candidate; records its fingerprint if it is new.
    pub fn admit(&mut self, candidate: &Transaction) -> bool {
        let fingerprint = Fingerprint::of(candidate);
        if self.known.insert(fingerprint) {
            true
        } else {
            self.skipped_total += 1;
            false
        }
    }

    /// Split an ordered candidate batch into new records and skipped duplicates
    pub fn filter(&mut self, candidates: Vec<Transaction>) -> DedupOutcome {
        let mut accepted = Vec::with_capacity(candidates.len());
        let mut skipped = Vec::new();

        for (index, candidate) in candidates.into_iter().enumerate() {
            let fingerprint = Fingerprint::of(&candidate);
            if self.known.contains(&fingerprint) {
                debug!(id = %candidate.id, %fingerprint, "skipping duplicate candidate");
                self.skipped_total += 1;
                skipped.push(SkippedDuplicate {
                    index,
                    id: candidate.id,
                    fingerprint,
                });
            } else {
                self.known.insert(fingerprint);
                accepted.push(candidate);
            }
        }

        DedupOutcome { accepted, skipped }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::SoftRef;

    fn create_test_transaction(id: &str, amount: f64, description: &str, account: &str) -> Transaction {
        Transaction::new(
            id,
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            amount,
            description,
            SoftRef::new(account, "Checking"),
        )
    }

    #[test]
    fn test_fingerprint_ignores_identity_key() {
        let tx1 = create_test_transaction("a", 100.0, "coffee", "1");
        let tx2 = create_test_transaction("b", 100.0, "coffee", "1");
        assert_eq!(Fingerprint::of(&tx1), Fingerprint::of(&tx2));
    }

    #[test]
    fn test_fingerprint_normalizes_case_and_whitespace() {
        let tx1 = create_test_transaction("a", 100.0, "  Coffee   SHOP ", "1");
        let tx2 = create_test_transaction("b", 100.0, "coffee shop", "1");
        assert_eq!(Fingerprint::of(&tx1), Fingerprint::of(&tx2));
    }

    #[test]
    fn test_fingerprint_distinguishes_fields() {
        let base = create_test_transaction("a", 100.0, "coffee", "1");
        assert_ne!(Fingerprint::of(&base), Fingerprint::of(&create_test_transaction("a", 100.01, "coffee", "1")));
        assert_ne!(Fingerprint::of(&base), Fingerprint::of(&create_test_transaction("a", 100.0, "tea", "1")));
        assert_ne!(Fingerprint::of(&base), Fingerprint::of(&create_test_transaction("a", 100.0, "coffee", "2")));
    }

    #[test]
    fn test_fingerprint_is_not_fuzzy() {
        let tx1 = create_test_transaction("a", 100.0, "coffee", "1");
        let tx2 = create_test_transaction("b", 100.0, "coffe", "1");
        assert_ne!(Fingerprint::of(&tx1), Fingerprint::of(&tx2));
    }

    #[test]
    fn test_is_duplicate_against_set() {
        let existing = create_test_transaction("old", 100.0, "coffee", "1");
        let against: HashSet<Fingerprint> = [Fingerprint::of(&existing)].into_iter().collect();

        assert!(is_duplicate(&create_test_transaction("new", 100.0, "Coffee", "1"), &against));
        assert!(!is_duplicate(&create_test_transaction("new", 5.0, "Coffee", "1"), &against));
    }

    #[test]
    fn test_filter_counts_existing_and_intra_batch_duplicates() {
        let existing = create_test_transaction("old", 100.0, "coffee", "1");
        let mut detector = DuplicateDetector::new([Fingerprint::of(&existing)].into_iter().collect());

        let outcome = detector.filter(vec![
            create_test_transaction("n1", 100.0, "coffee", "1"), // existing
            create_test_transaction("n2", 7.5, "lunch", "1"),
            create_test_transaction("n3", 7.5, "LUNCH", "1"), // repeats n2
        ]);

        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].id, "n2");
        assert_eq!(outcome.skipped_count(), 2);
        assert_eq!(outcome.skipped[0].index, 0);
        assert_eq!(outcome.skipped[1].id, "n3");
        assert_eq!(detector.skipped_total(), 2);
    }

    #[test]
    fn test_admit_records_new_fingerprint() {
        let mut detector = DuplicateDetector::default();
        let tx = create_test_transaction("a", 1.0, "x", "1");
        assert!(detector.admit(&tx));
        assert!(!detector.admit(&tx));
        assert_eq!(detector.known_count(), 1);
        assert_eq!(detector.skipped_total(), 1);
    }
}
