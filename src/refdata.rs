//! Reference data directory
//!
//! Read-only view of securities, books and limit attributions, loaded at
//! boot. Curation happens upstream; the core only consumes it. Unknown keys
//! here are what sends an inbound event to the park-and-retry path.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::core_types::{AuId, BookId, ClientId, SecurityId};
use crate::models::Security;

/// Directory the engines resolve opaque identifiers against
#[derive(Debug, Default)]
pub struct RefData {
    securities: FxHashMap<SecurityId, Security>,
    books: FxHashSet<BookId>,
    /// Book -> aggregation unit (regulatory grouping)
    book_au: FxHashMap<BookId, AuId>,
    /// Client -> books it trades through
    client_books: FxHashMap<ClientId, Vec<BookId>>,
}

impl RefData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_security(&mut self, security: Security) {
        self.securities.insert(security.internal_id.clone(), security);
    }

    pub fn add_book(&mut self, book_id: impl Into<BookId>, au_id: Option<AuId>) {
        let book_id = book_id.into();
        if let Some(au) = au_id {
            self.book_au.insert(book_id.clone(), au);
        }
        self.books.insert(book_id);
    }

    pub fn add_client_book(&mut self, client_id: impl Into<ClientId>, book_id: impl Into<BookId>) {
        self.client_books
            .entry(client_id.into())
            .or_default()
            .push(book_id.into());
    }

    pub fn security(&self, id: &str) -> Option<&Security> {
        self.securities.get(id)
    }

    pub fn knows_security(&self, id: &str) -> bool {
        self.securities.contains_key(id)
    }

    pub fn knows_book(&self, id: &str) -> bool {
        self.books.contains(id)
    }

    /// Market of a security, empty when unknown
    pub fn market_of(&self, security_id: &str) -> &str {
        self.securities
            .get(security_id)
            .map(|s| s.market.as_str())
            .unwrap_or("")
    }

    pub fn au_of_book(&self, book_id: &str) -> Option<&AuId> {
        self.book_au.get(book_id)
    }

    pub fn books_of_client(&self, client_id: &str) -> &[BookId] {
        self.client_books
            .get(client_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn aus(&self) -> impl Iterator<Item = &AuId> {
        self.book_au.values()
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientId> {
        self.client_books.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SecurityStatus, SecurityType};

    fn security(id: &str, market: &str) -> Security {
        Security {
            internal_id: id.to_string(),
            security_type: SecurityType::Equity,
            market: market.to_string(),
            currency: "USD".to_string(),
            status: SecurityStatus::Active,
            is_basket_product: false,
            basket_type: None,
        }
    }

    #[test]
    fn test_directory_lookups() {
        let mut rd = RefData::new();
        rd.add_security(security("AAPL", "US"));
        rd.add_book("EQ-01", Some("AU-1".to_string()));
        rd.add_client_book("C-123", "EQ-01");

        assert!(rd.knows_security("AAPL"));
        assert!(!rd.knows_security("TSLA"));
        assert!(rd.knows_book("EQ-01"));
        assert_eq!(rd.market_of("AAPL"), "US");
        assert_eq!(rd.market_of("TSLA"), "");
        assert_eq!(rd.au_of_book("EQ-01"), Some(&"AU-1".to_string()));
        assert_eq!(rd.books_of_client("C-123"), ["EQ-01".to_string()]);
    }
}
