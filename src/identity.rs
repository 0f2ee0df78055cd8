//! Identity Resolver (SPEC_FULL §4.5): canonical identity selection and
//! URL canonicalization/hashing.
//!
//! Grounded on the `url` crate for parsing/serialization (already a
//! dependency of this crate for feed URLs) rather than hand-rolled string
//! surgery, consistent with the parser's URL normalization.

use sha2::{Digest, Sha256};
use url::Url;

use crate::models::IdType;
use crate::parser::ParsedProduct;

/// Query-parameter names (and, for a couple of prefixes, substrings)
/// stripped before hashing so affiliate click-tracking noise never
/// fragments identity.
const TRACKING_PARAM_PREFIXES: &[&str] = &["utm_", "impactradius_"];
const TRACKING_PARAM_EXACT: &[&str] = &[
    "irclickid",
    "clickid",
    "gclid",
    "fbclid",
    "ref",
    "source",
    "partner_id",
    "affiliate_id",
    "irgwc",
];

/// The identifier chosen to represent a [`ParsedProduct`]'s identity,
/// plus every alternate identifier observed on the row.
pub struct ResolvedIdentity {
    pub canonical_key: String,
    pub canonical_type: IdType,
    pub alternates: Vec<AlternateIdentifier>,
    pub used_url_hash_fallback: bool,
}

pub struct AlternateIdentifier {
    pub id_type: IdType,
    pub raw_value: String,
    pub normalized_value: String,
    pub is_canonical: bool,
}

pub struct IdentityResolver;

impl IdentityResolver {
    /// Canonical precedence: network item id, then SKU, then URL hash.
    /// UPC is never canonical — it identifies a catalog entry across
    /// retailers, not a single retailer's listing.
    pub fn resolve(product: &ParsedProduct) -> ResolvedIdentity {
        let normalized_url = canonicalize_url(&product.url);
        let url_hash = hash_url(&normalized_url);

        let candidates: [(IdType, Option<&str>); 2] = [
            (IdType::NetworkItemId, product.network_item_id.as_deref()),
            (IdType::Sku, product.sku.as_deref()),
        ];

        let mut canonical: Option<(IdType, String)> = None;
        for (id_type, raw) in candidates {
            if let Some(value) = raw.filter(|v| !v.trim().is_empty()) {
                canonical = Some((id_type, value.to_string()));
                break;
            }
        }

        let used_url_hash_fallback = canonical.is_none();
        let (canonical_type, canonical_key) =
            canonical.unwrap_or_else(|| (IdType::UrlHash, url_hash.clone()));

        let mut alternates = Vec::new();
        if let Some(value) = product.network_item_id.as_deref().filter(|v| !v.is_empty()) {
            alternates.push(AlternateIdentifier {
                id_type: IdType::NetworkItemId,
                raw_value: value.to_string(),
                normalized_value: value.to_string(),
                is_canonical: canonical_type == IdType::NetworkItemId,
            });
        }
        if let Some(value) = product.sku.as_deref().filter(|v| !v.is_empty()) {
            alternates.push(AlternateIdentifier {
                id_type: IdType::Sku,
                raw_value: value.to_string(),
                normalized_value: value.to_string(),
                is_canonical: canonical_type == IdType::Sku,
            });
        }
        if let Some(value) = product.upc.as_deref().filter(|v| !v.is_empty()) {
            alternates.push(AlternateIdentifier {
                id_type: IdType::Upc,
                raw_value: value.to_string(),
                normalized_value: value.to_string(),
                is_canonical: false,
            });
        }
        alternates.push(AlternateIdentifier {
            id_type: IdType::Url,
            raw_value: product.url.clone(),
            normalized_value: normalized_url.clone(),
            is_canonical: false,
        });
        alternates.push(AlternateIdentifier {
            id_type: IdType::UrlHash,
            raw_value: product.url.clone(),
            normalized_value: url_hash.clone(),
            is_canonical: canonical_type == IdType::UrlHash,
        });

        ResolvedIdentity {
            canonical_key,
            canonical_type,
            alternates,
            used_url_hash_fallback,
        }
    }
}

/// Lower-case scheme and host, preserve path/query case, sort query
/// parameters, strip tracking params, drop a trailing slash.
pub fn canonicalize_url(raw: &str) -> String {
    let Ok(mut parsed) = Url::parse(raw) else {
        return raw.to_string();
    };

    let scheme = parsed.scheme().to_lowercase();
    let _ = parsed.set_scheme(&scheme);
    if let Some(host) = parsed.host_str() {
        let lower = host.to_lowercase();
        let _ = parsed.set_host(Some(&lower));
    }

    let mut kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    kept.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &kept {
            serializer.append_pair(k, v);
        }
        parsed.set_query(Some(&serializer.finish()));
    }

    let mut result = parsed.to_string();
    if let Some(stripped) = result.strip_suffix('/') {
        if !stripped.ends_with("//") {
            result = stripped.to_string();
        }
    }
    result
}

fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_lowercase();
    TRACKING_PARAM_EXACT.contains(&lower.as_str())
        || TRACKING_PARAM_PREFIXES.iter().any(|p| lower.starts_with(p))
}

pub fn hash_url(normalized_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_url.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn product(network_item_id: Option<&str>, sku: Option<&str>, upc: Option<&str>) -> ParsedProduct {
        ParsedProduct {
            name: "Widget".into(),
            url: "https://Example.com/item?utm_source=x&b=2&a=1".into(),
            price: rust_decimal::Decimal::new(999, 2),
            network_item_id: network_item_id.map(String::from),
            sku: sku.map(String::from),
            upc: upc.map(String::from),
            brand: None,
            category: None,
            caliber: None,
            grain_weight: None,
            round_count: None,
            description: None,
            image_url: None,
            in_stock: true,
            original_price: None,
            currency: "USD".into(),
        }
    }

    #[test]
    fn network_item_id_wins_over_sku_and_url() {
        let p = product(Some("NET-1"), Some("SKU-1"), None);
        let resolved = IdentityResolver::resolve(&p);
        assert_eq!(resolved.canonical_type, IdType::NetworkItemId);
        assert_eq!(resolved.canonical_key, "NET-1");
        assert!(!resolved.used_url_hash_fallback);
    }

    #[test]
    fn sku_wins_when_network_item_id_absent() {
        let p = product(None, Some("SKU-1"), None);
        let resolved = IdentityResolver::resolve(&p);
        assert_eq!(resolved.canonical_type, IdType::Sku);
        assert_eq!(resolved.canonical_key, "SKU-1");
    }

    #[test]
    fn falls_back_to_url_hash_when_no_other_identifier() {
        let p = product(None, None, None);
        let resolved = IdentityResolver::resolve(&p);
        assert_eq!(resolved.canonical_type, IdType::UrlHash);
        assert!(resolved.used_url_hash_fallback);
        assert_eq!(resolved.canonical_key.len(), 64);
    }

    #[test]
    fn upc_is_never_canonical_even_when_present_alone() {
        let p = product(None, None, Some("012345678905"));
        let resolved = IdentityResolver::resolve(&p);
        assert_eq!(resolved.canonical_type, IdType::UrlHash);
        assert!(resolved.alternates.iter().any(|a| a.id_type == IdType::Upc && !a.is_canonical));
    }

    #[test]
    fn url_canonicalization_lowercases_host_strips_tracking_and_sorts_query() {
        let canon = canonicalize_url("https://Example.COM/Item?utm_source=x&b=2&a=1&irclickid=z");
        assert_eq!(canon, "https://example.com/Item?a=1&b=2");
    }

    #[test]
    fn url_canonicalization_strips_trailing_slash() {
        assert_eq!(canonicalize_url("https://example.com/item/"), "https://example.com/item");
        assert_eq!(canonicalize_url("https://example.com/"), "https://example.com");
    }

    #[test]
    fn url_hash_is_stable_for_equivalent_urls() {
        let a = hash_url(&canonicalize_url("https://Example.com/item?b=2&a=1&utm_source=ad"));
        let b = hash_url(&canonicalize_url("https://example.com/item/?a=1&b=2"));
        assert_eq!(a, b);
    }

    #[test]
    fn same_row_emits_every_alternate_identifier_with_one_canonical() {
        let p = product(Some("NET-1"), Some("SKU-1"), Some("012345678905"));
        let resolved = IdentityResolver::resolve(&p);
        let canonical_count = resolved.alternates.iter().filter(|a| a.is_canonical).count();
        assert_eq!(canonical_count, 1);
        // network item id, SKU, UPC, raw URL, URL hash.
        assert_eq!(resolved.alternates.len(), 5);
    }

    proptest! {
        /// Canonicalizing an already-canonical URL is a no-op: the sort and
        /// strip rules are idempotent, so running them twice should never
        /// move the string further.
        #[test]
        fn canonicalize_url_is_idempotent(
            scheme in "https?",
            host in "[a-z]{3,10}\\.com",
            path in "[a-z/]{0,10}",
            a in 0u32..50,
            b in 0u32..50,
        ) {
            let raw = format!("{scheme}://{host}/{path}?b={b}&a={a}&utm_source=x");
            let once = canonicalize_url(&raw);
            let twice = canonicalize_url(&once);
            prop_assert_eq!(once, twice);
        }
    }
}
