use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("extraction backend error: {0}")]
    Backend(String),
    #[error("extraction produced an unusable payload: {0}")]
    Malformed(String),
}

/// Storage key of the anonymous (signed-out) record collection.
pub const ANONYMOUS_NAMESPACE: &str = "receipts.local";

/// Superseded storage keys absorbed by the one-way legacy migration,
/// in scan order.
pub const LEGACY_NAMESPACES: [&str; 2] = ["receiptHistory", "analyzedReceipts"];

/// Unique record identifier within one namespace.
///
/// New ids are ULID strings; decoding accepts any string so that records
/// written by older client revisions keep their original ids. An empty id
/// cannot participate in dedup and is dropped by [`merge_collections`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(transparent)]
pub struct ReceiptId(String);

impl ReceiptId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for ReceiptId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated user as reported by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), display_name: display_name.into() }
    }

    #[must_use]
    pub fn owner_stamp(&self) -> RecordOwner {
        RecordOwner {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// Advisory copy of the owning identity persisted on a record.
///
/// Display-only: where a record lives is decided by its namespace, and the
/// merge engine re-stamps this field from the destination identity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordOwner {
    pub user_id: String,
    pub display_name: String,
}

/// Storage partition key: the single anonymous namespace, or one
/// `cloud:<user_id>` namespace per identity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    #[must_use]
    pub fn anonymous() -> Self {
        Self(ANONYMOUS_NAMESPACE.to_string())
    }

    /// Namespace for an authenticated identity. Keyed by the stable user id
    /// only; mutable fields such as the display name never enter the key.
    #[must_use]
    pub fn for_identity(identity: &Identity) -> Self {
        Self(format!("cloud:{}", identity.user_id))
    }

    /// Pure, total mapping from "current identity or none" to a namespace.
    #[must_use]
    pub fn resolve(identity: Option<&Identity>) -> Self {
        match identity {
            Some(identity) => Self::for_identity(identity),
            None => Self::anonymous(),
        }
    }

    /// Namespace addressed by its raw stored name. Used for the fixed legacy
    /// keys and for storage diagnostics that walk every stored namespace.
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self(name.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS_NAMESPACE
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One purchased item as extracted from the receipt image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LineItem {
    pub category: String,
    pub store: String,
    pub name: String,
    pub original_name: String,
    pub price_domestic_currency: f64,
    pub price_foreign_currency: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One persisted, analyzed receipt.
///
/// At-rest JSON uses camelCase names (`createdAt`, `totalDomesticCurrency`,
/// ...), the schema the legacy namespaces already hold. `created_at` is the
/// capture time in milliseconds since epoch and is the listing sort key;
/// `transaction_date`/`transaction_time` describe when the purchase
/// happened and are display strings, never sort keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Receipt {
    pub id: ReceiptId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<RecordOwner>,
    pub created_at: i64,
    pub transaction_date: String,
    pub transaction_time: String,
    pub exchange_rate: f64,
    pub total_domestic_currency: f64,
    pub total_foreign_currency: f64,
    pub line_items: Vec<LineItem>,
}

impl Receipt {
    #[must_use]
    pub fn is_owned_by(&self, identity: &Identity) -> bool {
        self.owner.as_ref().is_some_and(|owner| owner.user_id == identity.user_id)
    }
}

/// Unvalidated candidate record produced by the extraction collaborator.
///
/// Never persisted as-is: [`ReceiptDraft::normalize`] turns it into a
/// canonical [`Receipt`] or rejects it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiptDraft {
    pub id: Option<ReceiptId>,
    pub transaction_date: Option<String>,
    pub transaction_time: Option<String>,
    pub exchange_rate: Option<f64>,
    pub total_domestic_currency: Option<f64>,
    pub total_foreign_currency: Option<f64>,
    pub line_items: Vec<LineItem>,
}

impl ReceiptDraft {
    /// Validate and normalize this candidate into a canonical [`Receipt`].
    ///
    /// Missing totals are computed from the line items; a missing exchange
    /// rate is derived from the two totals when both are positive. A missing
    /// or empty id is replaced by a freshly generated one, and `captured_at`
    /// becomes the immutable `created_at`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the draft carries neither
    /// line items nor totals, or when any amount is negative or non-finite.
    pub fn normalize(
        self,
        captured_at: i64,
        identity: Option<&Identity>,
    ) -> Result<Receipt, LedgerError> {
        if self.line_items.is_empty()
            && self.total_domestic_currency.is_none()
            && self.total_foreign_currency.is_none()
        {
            return Err(LedgerError::Validation(
                "draft carries neither line items nor totals".to_string(),
            ));
        }

        for item in &self.line_items {
            require_amount("line item domestic price", item.price_domestic_currency)?;
            require_amount("line item foreign price", item.price_foreign_currency)?;
        }
        if let Some(total) = self.total_domestic_currency {
            require_amount("domestic total", total)?;
        }
        if let Some(total) = self.total_foreign_currency {
            require_amount("foreign total", total)?;
        }
        if let Some(rate) = self.exchange_rate {
            require_amount("exchange rate", rate)?;
        }

        let total_domestic_currency = self.total_domestic_currency.unwrap_or_else(|| {
            self.line_items.iter().map(|item| item.price_domestic_currency).sum()
        });
        let total_foreign_currency = self.total_foreign_currency.unwrap_or_else(|| {
            self.line_items.iter().map(|item| item.price_foreign_currency).sum()
        });
        let exchange_rate = match self.exchange_rate {
            Some(rate) => rate,
            None if total_foreign_currency > 0.0 => {
                total_domestic_currency / total_foreign_currency
            }
            None => 0.0,
        };

        let id = match self.id {
            Some(id) if !id.is_empty() => id,
            _ => ReceiptId::generate(),
        };

        Ok(Receipt {
            id,
            owner: identity.map(Identity::owner_stamp),
            created_at: captured_at,
            transaction_date: self.transaction_date.unwrap_or_default(),
            transaction_time: self.transaction_time.unwrap_or_default(),
            exchange_rate,
            total_domestic_currency,
            total_foreign_currency,
            line_items: self.line_items,
        })
    }
}

fn require_amount(label: &str, value: f64) -> Result<(), LedgerError> {
    if !value.is_finite() {
        return Err(LedgerError::Validation(format!("{label} is not a finite number")));
    }
    if value < 0.0 {
        return Err(LedgerError::Validation(format!("{label} is negative: {value}")));
    }
    Ok(())
}

/// Identity provider as seen by the persistence core: an input, never
/// something this crate computes.
pub trait IdentityProvider {
    fn current_identity(&self) -> Option<Identity>;
    fn logout(&mut self);
}

/// Fixed identity source used by the CLI and by tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    identity: Option<Identity>,
}

impl StaticIdentityProvider {
    #[must_use]
    pub fn new(identity: Option<Identity>) -> Self {
        Self { identity }
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn current_identity(&self) -> Option<Identity> {
        self.identity.clone()
    }

    fn logout(&mut self) {
        self.identity = None;
    }
}

/// Vision-model extraction collaborator. Failures are propagated, not
/// retried, by this core; retry policy belongs to the implementation.
pub trait ReceiptExtractor {
    /// Turn a captured image payload into a candidate draft.
    ///
    /// # Errors
    /// Returns [`ExtractionError`] when the backend fails or returns a
    /// payload that cannot be interpreted as a draft.
    fn extract(&self, image: &[u8]) -> Result<ReceiptDraft, ExtractionError>;
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}

/// The single listing order: capture time descending, id ascending as the
/// deterministic tie-breaker.
pub fn sort_newest_first(records: &mut [Receipt]) {
    records.sort_by(|lhs, rhs| {
        rhs.created_at.cmp(&lhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
    });
}

/// Deterministically reconcile two record collections into one.
///
/// This is the single merge algorithm for every combination of collections,
/// whether triggered by sync-on-login or by backup import:
///
/// 1. Seed an id-keyed map from `primary`; records with an empty id cannot
///    participate in dedup and are dropped.
/// 2. Insert each `secondary` record only when its id is absent — the
///    destination collection is assumed already canonical, so primary wins
///    every collision.
/// 3. When `assign_owner` is given, re-stamp the advisory owner on every
///    record not already owned by that identity.
/// 4. Return the values sorted newest-first.
#[must_use]
pub fn merge_collections(
    primary: &[Receipt],
    secondary: &[Receipt],
    assign_owner: Option<&Identity>,
) -> Vec<Receipt> {
    let mut by_id: BTreeMap<ReceiptId, Receipt> = BTreeMap::new();
    for record in primary.iter().chain(secondary) {
        if record.id.is_empty() {
            continue;
        }
        by_id.entry(record.id.clone()).or_insert_with(|| record.clone());
    }

    let mut merged: Vec<Receipt> = by_id.into_values().collect();
    if let Some(identity) = assign_owner {
        for record in &mut merged {
            if !record.is_owned_by(identity) {
                record.owner = Some(identity.owner_stamp());
            }
        }
    }

    sort_newest_first(&mut merged);
    merged
}
