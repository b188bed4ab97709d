//! Address registry: parse address headers and map each address to a
//! deduplicated subscriber key.

use crate::error::{ErrorPolicy, StoreError};
use crate::models::Address;
use crate::store::StoreSession;
use mailparse::{MailAddr, addrparse};

/// Collapse doubled angle brackets (`<<a@x>>`) produced by some mailers.
fn collapse_brackets(value: &str) -> String {
    value.replace("<<", "<").replace(">>", ">")
}

/// Parse the joined values of one address header, in header order.
///
/// Group syntax is flattened into its members. An unparseable header yields
/// no addresses.
pub fn parse_address_list(value: &str) -> Vec<Address> {
    let value = collapse_brackets(value);
    if value.trim().is_empty() {
        return Vec::new();
    }

    let list = match addrparse(&value) {
        Ok(list) => list,
        Err(err) => {
            log::warn!("unparseable address header '{}': {}", value, err);
            return Vec::new();
        }
    };

    let mut addresses = Vec::new();
    for entry in list.iter() {
        match entry {
            MailAddr::Single(single) => addresses.push(Address::new(
                single.addr.clone(),
                single.display_name.clone().unwrap_or_default(),
            )),
            MailAddr::Group(group) => {
                for single in &group.addrs {
                    addresses.push(Address::new(
                        single.addr.clone(),
                        single.display_name.clone().unwrap_or_default(),
                    ));
                }
            }
        }
    }
    addresses
}

/// Parse all occurrences of an address header as one comma-separated list.
pub fn parse_address_headers(values: &[&str]) -> Vec<Address> {
    if values.is_empty() {
        return Vec::new();
    }
    parse_address_list(&values.join(", "))
}

pub struct AddressRegistry<'a> {
    policy: &'a ErrorPolicy,
}

impl<'a> AddressRegistry<'a> {
    pub fn new(policy: &'a ErrorPolicy) -> Self {
        Self { policy }
    }

    /// Resolve subscriber keys for `addresses`, preserving their order.
    ///
    /// An address whose insert conflicts and whose lookup then finds nothing
    /// is skipped with a warning. Fatal store errors propagate.
    pub async fn resolve<S: StoreSession>(
        &self,
        session: &mut S,
        addresses: &[Address],
    ) -> Result<Vec<i64>, StoreError> {
        let mut ids = Vec::with_capacity(addresses.len());
        for address in addresses {
            match session.insert_or_get_subscriber(self.policy, address).await? {
                Some(id) => ids.push(id),
                None => log::warn!(
                    "subscriber '{}' <{}> conflicted but was not found",
                    address.display_name,
                    address.address
                ),
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UNIQUE_VIOLATION;
    use crate::store::{MailStore, MemoryStore};

    #[test]
    fn test_parse_display_names() {
        let addresses = parse_address_list("Alice <alice@example.com>, bob@example.com");
        assert_eq!(
            addresses,
            vec![
                Address::new("alice@example.com", "Alice"),
                Address::new("bob@example.com", ""),
            ]
        );
    }

    #[test]
    fn test_parse_doubled_brackets() {
        let addresses = parse_address_list("<<a@x.com>>");
        assert_eq!(addresses, vec![Address::new("a@x.com", "")]);
    }

    #[test]
    fn test_parse_group_is_flattened() {
        let addresses = parse_address_list("team: a@x.com, b@x.com;");
        assert_eq!(
            addresses,
            vec![Address::new("a@x.com", ""), Address::new("b@x.com", "")]
        );
    }

    #[test]
    fn test_parse_repeated_headers() {
        let addresses = parse_address_headers(&["a@x.com", "b@x.com"]);
        assert_eq!(addresses.len(), 2);
        assert!(parse_address_headers(&[]).is_empty());
        assert!(parse_address_list("  ").is_empty());
    }

    #[tokio::test]
    async fn test_resolve_preserves_order_and_deduplicates() {
        let store = MemoryStore::new();
        let mut session = store.session().await.unwrap();
        let policy = ErrorPolicy::new([UNIQUE_VIOLATION]);
        let registry = AddressRegistry::new(&policy);

        let addresses = vec![
            Address::new("b@x.com", ""),
            Address::new("a@x.com", "A"),
            Address::new("b@x.com", ""),
        ];
        let ids = registry.resolve(&mut session, &addresses).await.unwrap();
        assert_eq!(ids, vec![1, 2, 1]);
        assert_eq!(store.subscribers().len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_stops_on_fatal_store_error() {
        let store = MemoryStore::new();
        store.fail_subscriber("bad@x.com");
        let mut session = store.session().await.unwrap();
        let policy = ErrorPolicy::new([UNIQUE_VIOLATION]);
        let registry = AddressRegistry::new(&policy);

        let addresses = vec![
            Address::new("a@x.com", ""),
            Address::new("bad@x.com", ""),
            Address::new("c@x.com", ""),
        ];
        let err = registry.resolve(&mut session, &addresses).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("XX000"));

        let stored: Vec<String> = store
            .subscribers()
            .into_iter()
            .map(|row| row.address.address)
            .collect();
        assert_eq!(stored, vec!["a@x.com".to_string()]);
    }
}
