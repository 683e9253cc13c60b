//! Identity resolution
//!
//! - `phone`: identifier classification and phone variant expansion
//! - `index`: immutable variant → person lookup table
//! - `resolver`: raw token → `ResolvedIdentity`
//! - `third_party`: run-wide registry of unmapped contacts

pub mod index;
pub mod phone;
pub mod resolver;
pub mod third_party;

pub use index::IdentifierIndex;
pub use resolver::IdentityResolver;
pub use third_party::{ThirdPartyContact, ThirdPartyRegistry};
