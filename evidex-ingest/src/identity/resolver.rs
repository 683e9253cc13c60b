//! Raw token → `ResolvedIdentity`

use crate::identity::phone;
use crate::identity::IdentifierIndex;
use crate::models::ResolvedIdentity;
use evidex_common::{IngestConfig, Result};

/// Read-only resolver shared by every adapter
///
/// Holds no interior mutability, so concurrent adapters may call `resolve`
/// without synchronization. Unmatched tokens are collected by the adapters
/// into their reports and registered by the coordinator.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    index: IdentifierIndex,
    self_name: String,
}

impl IdentityResolver {
    /// Build from configuration; fails on ambiguous mappings
    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        let index = if config.person_identifiers.contains_key(&config.self_name) {
            IdentifierIndex::build(&config.person_identifiers)?
        } else {
            // Self is always a person, even with no identifiers configured
            let mut persons = config.person_identifiers.clone();
            persons.insert(config.self_name.clone(), Vec::new());
            IdentifierIndex::build(&persons)?
        };
        Ok(Self::new(index, config.self_name.clone()))
    }

    pub fn new(index: IdentifierIndex, self_name: impl Into<String>) -> Self {
        Self {
            index,
            self_name: self_name.into(),
        }
    }

    /// Resolve a raw sender/recipient token. Never fails.
    pub fn resolve(&self, raw_token: &str) -> ResolvedIdentity {
        let key = phone::normalize_key(raw_token);
        if let Some(person) = self.index.get(&key) {
            return ResolvedIdentity::Person(person.to_string());
        }
        if let Some(canonical) = phone::canonical_phone(raw_token) {
            if let Some(person) = self.index.get(&canonical) {
                return ResolvedIdentity::Person(person.to_string());
            }
        }
        ResolvedIdentity::Unmapped(raw_token.trim().to_string())
    }

    /// The device owner / exporter
    pub fn self_identity(&self) -> ResolvedIdentity {
        ResolvedIdentity::Person(self.self_name.clone())
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    pub fn is_self(&self, identity: &ResolvedIdentity) -> bool {
        identity.is_person(&self.self_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn resolver() -> IdentityResolver {
        let mut ids = BTreeMap::new();
        ids.insert("Jordan".to_string(), vec!["+12065551234".to_string()]);
        ids.insert(
            "Alex".to_string(),
            vec!["alex@example.com".to_string(), "Lex".to_string()],
        );
        IdentityResolver::new(IdentifierIndex::build(&ids).unwrap(), "Alex")
    }

    #[test]
    fn test_phone_formats_resolve_to_same_person() {
        let r = resolver();
        let expected = ResolvedIdentity::Person("Jordan".to_string());
        assert_eq!(r.resolve("+12065551234"), expected);
        assert_eq!(r.resolve("206-555-1234"), expected);
        assert_eq!(r.resolve("(206) 555-1234"), expected);
        assert_eq!(r.resolve("1 (206) 555 1234"), expected);
    }

    #[test]
    fn test_email_and_alias_case_insensitive() {
        let r = resolver();
        assert_eq!(r.resolve("ALEX@example.com"), r.self_identity());
        assert_eq!(r.resolve(" lex "), r.self_identity());
        assert!(r.is_self(&r.resolve("Alex")));
    }

    #[test]
    fn test_unmatched_keeps_raw_token() {
        let r = resolver();
        assert_eq!(
            r.resolve("+15550001111"),
            ResolvedIdentity::Unmapped("+15550001111".to_string())
        );
    }

    #[test]
    fn test_self_without_identifiers_still_resolves() {
        let mut config = IngestConfig::new("Riley");
        config
            .person_identifiers
            .insert("Jordan".to_string(), vec!["+12065551234".to_string()]);
        let r = IdentityResolver::from_config(&config).unwrap();
        assert!(r.is_self(&r.resolve("riley")));
    }
}
