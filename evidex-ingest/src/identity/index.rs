//! Immutable identifier index
//!
//! Built once from configuration. Every normalized variant maps to exactly one
//! person; an overlap between two persons is a configuration bug and fails
//! the build before any extraction starts.

use crate::identity::phone::{self, IdentifierKind};
use evidex_common::{Error, Result};
use std::collections::{BTreeMap, HashMap};

/// Normalized identifier variant → person name
#[derive(Debug, Clone, Default)]
pub struct IdentifierIndex {
    variants: HashMap<String, String>,
}

impl IdentifierIndex {
    /// Expand configured identifiers into the variant table
    ///
    /// Person names are added as implicit aliases so display names in
    /// exports resolve without being listed twice.
    pub fn build(person_identifiers: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut index = Self::default();

        for (person, identifiers) in person_identifiers {
            if person.trim().is_empty() {
                return Err(Error::Config("person name must not be empty".to_string()));
            }
            index.insert(person, &phone::normalize_key(person), person)?;

            for raw in identifiers {
                if raw.trim().is_empty() {
                    tracing::warn!(person = %person, "Ignoring empty identifier");
                    continue;
                }
                let variants = match phone::classify(raw) {
                    IdentifierKind::Phone => phone::phone_variants(raw),
                    IdentifierKind::Email | IdentifierKind::Alias => {
                        vec![phone::normalize_key(raw)]
                    }
                };
                for variant in variants {
                    index.insert(person, &variant, raw)?;
                }
            }
        }

        tracing::info!(
            persons = person_identifiers.len(),
            variants = index.variants.len(),
            "Identifier index built"
        );
        Ok(index)
    }

    fn insert(&mut self, person: &str, variant: &str, source_identifier: &str) -> Result<()> {
        match self.variants.get(variant) {
            Some(existing) if existing != person => Err(Error::Config(format!(
                "identifier variant '{}' (from '{}') maps to both '{}' and '{}'",
                variant, source_identifier, existing, person
            ))),
            Some(_) => Ok(()),
            None => {
                self.variants.insert(variant.to_string(), person.to_string());
                Ok(())
            }
        }
    }

    /// O(1) lookup of an already-normalized variant
    pub fn get(&self, variant: &str) -> Option<&str> {
        self.variants.get(variant).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}
