// 💳 Account Entity
//
// "Account name is a VALUE (can change), account id is IDENTITY (never changes)"
//
// Transactions point at accounts through soft references, so renaming or
// deleting an account never breaks historical transactions.

use super::{DerivedColumns, DomainEntity, EntityKind};
use serde::{Deserialize, Serialize};

// ============================================================================
// ACCOUNT TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    /// Checking account (debit card, daily transactions)
    Checking,

    /// Savings account (interest-bearing)
    Savings,

    /// Credit card (credit line)
    Credit,

    /// Cash wallet
    Cash,

    /// Investment account (brokerage, stocks, bonds)
    Investment,

    /// Other / Unknown
    Other,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Checking => "Checking",
            AccountType::Savings => "Savings",
            AccountType::Credit => "Credit",
            AccountType::Cash => "Cash",
            AccountType::Investment => "Investment",
            AccountType::Other => "Other",
        }
    }
}

impl Default for AccountType {
    fn default() -> Self {
        AccountType::Other
    }
}

// ============================================================================
// ACCOUNT ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Stable identity - NEVER changes
    pub id: String,

    /// Display name (e.g., "Checking", "Kaspi Gold")
    pub name: String,

    #[serde(default)]
    pub account_type: AccountType,

    /// ISO 4217 code: USD, EUR, KZT, ...
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Balance as last written by a producer; this core never recomputes it
    #[serde(default)]
    pub balance: f64,

    /// Added after the first schema revision; older records read as active
    #[serde(default)]
    pub is_archived: bool,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Account {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Account {
            id: id.into(),
            name: name.into(),
            account_type: AccountType::Other,
            currency: default_currency(),
            balance: 0.0,
            is_archived: false,
        }
    }

    pub fn with_type(mut self, account_type: AccountType) -> Self {
        self.account_type = account_type;
        self
    }

    pub fn with_balance(mut self, balance: f64) -> Self {
        self.balance = balance;
        self
    }

    /// Identity key for an account discovered by name during CSV import
    pub fn key_for_name(name: &str) -> String {
        let slug: Vec<String> = name
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        format!("account:{}", slug.join("-"))
    }
}

impl DomainEntity for Account {
    const KIND: EntityKind = EntityKind::Account;

    fn id(&self) -> &str {
        &self.id
    }

    fn derived(&self) -> DerivedColumns {
        DerivedColumns {
            sort_key: Some(self.name.to_lowercase()),
            fingerprint: None,
        }
    }
}
