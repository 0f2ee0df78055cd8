//! Parser (SPEC_FULL §4.4): tolerant tabular parsing into `ParsedProduct`s.
//!
//! Modeled on the CSV reading approach already used in this codebase
//! (`csv::ReaderBuilder` in flexible mode, manual per-column extraction
//! with graceful fallback) rather than a strict schema-derived reader,
//! because feeds are uncontrolled third-party input.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::FeedError;

/// One normalized, validated row. Required fields (`name`, `url`,
/// `price > 0`) are guaranteed non-empty/non-zero by construction: a row
/// failing validation never becomes a `ParsedProduct`, it becomes a
/// [`RowError`] instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedProduct {
    pub name: String,
    pub url: String,
    pub price: Decimal,
    pub network_item_id: Option<String>,
    pub sku: Option<String>,
    pub upc: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub caliber: Option<String>,
    pub grain_weight: Option<Decimal>,
    pub round_count: Option<i32>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub in_stock: bool,
    pub original_price: Option<Decimal>,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub row_number: u64,
    pub code: String,
    pub message: String,
}

pub struct ParseOutcome {
    pub products: Vec<ParsedProduct>,
    pub rows_read: u64,
    pub rows_parsed: u64,
    pub errors: Vec<RowError>,
}

/// Case-insensitive column aliases per logical field.
fn header_aliases() -> HashMap<&'static str, &'static [&'static str]> {
    HashMap::from([
        ("name", &["name", "title", "product_name", "productname"] as &[&str]),
        ("url", &["url", "link", "producturl", "product_url"] as &[&str]),
        ("price", &["price", "cost", "retail_price", "retailprice"] as &[&str]),
        ("network_item_id", &["network_item_id", "itemid", "item_id", "networkitemid"] as &[&str]),
        ("sku", &["sku", "mpn"] as &[&str]),
        ("upc", &["upc", "gtin", "ean"] as &[&str]),
        ("brand", &["brand", "manufacturer"] as &[&str]),
        ("category", &["category", "cat"] as &[&str]),
        ("caliber", &["caliber", "cal"] as &[&str]),
        ("grain_weight", &["grain_weight", "grainweight", "grain"] as &[&str]),
        ("round_count", &["round_count", "roundcount", "rounds"] as &[&str]),
        ("description", &["description", "desc"] as &[&str]),
        ("image_url", &["image_url", "imageurl", "image"] as &[&str]),
        ("stock", &["stock", "in_stock", "instock", "availability"] as &[&str]),
        ("original_price", &["original_price", "originalprice", "list_price", "msrp"] as &[&str]),
        ("currency", &["currency", "currency_code"] as &[&str]),
    ])
}

/// Fixed truthy/falsy alias table for stock status. Unrecognized values
/// default to `true` per SPEC_FULL §4.4.
fn is_truthy_stock(raw: &str) -> bool {
    let falsy = [
        "false", "0", "no", "n", "out of stock", "outofstock", "unavailable",
    ];
    !falsy.contains(&raw.trim().to_lowercase().as_str())
}

pub struct Parser;

impl Parser {
    /// `parse(bytes, maxRows, feedId) -> {products[], rowsRead, rowsParsed, errors[]}`.
    ///
    /// Fails the entire parse (returns `Err`) only on unclosed quotes or
    /// mid-record truncation; all other malformation is per-row.
    pub fn parse(bytes: &[u8], max_rows: usize, _feed_id: Uuid) -> Result<ParseOutcome, FeedError> {
        let stripped = strip_bom(bytes);

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(stripped);

        let headers = reader
            .headers()
            .map_err(|e| to_parse_error(e))?
            .clone();
        let column_index = resolve_columns(&headers);

        let mut products = Vec::new();
        let mut errors = Vec::new();
        let mut rows_read: u64 = 0;
        let mut rows_parsed: u64 = 0;
        let mut truncated = false;

        for (i, record) in reader.records().enumerate() {
            let row_number = i as u64 + 2; // header is row 1
            let record = match record {
                Ok(r) => r,
                Err(e) if is_fatal_csv_error(&e) => return Err(to_parse_error(e)),
                Err(e) => {
                    errors.push(RowError {
                        row_number,
                        code: "MALFORMED_ROW".into(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            rows_read += 1;

            if rows_read as usize > max_rows {
                if !truncated {
                    errors.push(RowError {
                        row_number,
                        code: "TOO_MANY_ROWS".into(),
                        message: format!("rows_read exceeded max_rows={max_rows}"),
                    });
                    truncated = true;
                }
                continue;
            }

            match parse_row(&record, &column_index, row_number) {
                Ok(product) => {
                    rows_parsed += 1;
                    products.push(product);
                }
                Err(err) => errors.push(err),
            }
        }

        Ok(ParseOutcome {
            products,
            rows_read,
            rows_parsed,
            errors,
        })
    }
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
    const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
    if bytes.starts_with(BOM) {
        &bytes[BOM.len()..]
    } else {
        bytes
    }
}

/// Only a broken underlying reader aborts the whole parse; a malformed
/// single record (unclosed quote, stray byte) is a per-row error.
fn is_fatal_csv_error(err: &csv::Error) -> bool {
    matches!(err.kind(), csv::ErrorKind::Io(_))
}

fn to_parse_error(err: csv::Error) -> FeedError {
    FeedError::parse(err.to_string())
}

fn resolve_columns(headers: &csv::StringRecord) -> HashMap<&'static str, usize> {
    let aliases = header_aliases();
    let mut index = HashMap::new();
    for (pos, raw_header) in headers.iter().enumerate() {
        let lower = raw_header.trim().to_lowercase();
        for (&field, candidates) in &aliases {
            if candidates.contains(&lower.as_str()) && !index.contains_key(field) {
                index.insert(field, pos);
            }
        }
    }
    index
}

fn get<'a>(record: &'a csv::StringRecord, index: &HashMap<&'static str, usize>, field: &str) -> Option<&'a str> {
    index
        .get(field)
        .and_then(|&pos| record.get(pos))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

fn normalize_string(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip currency symbols/commas, parse, round to 2 decimals.
fn normalize_price(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    let value = Decimal::from_str(&cleaned).ok()?;
    let rounded = value.round_dp(2);
    if rounded <= Decimal::ZERO {
        None
    } else {
        Some(rounded)
    }
}

/// Force `https://` if no scheme, validate hostname has a dot, reject
/// localhost/empty/loopback.
fn normalize_url(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };

    let parsed = url::Url::parse(&with_scheme).ok()?;
    let host = parsed.host_str()?.to_lowercase();

    if host.is_empty() || host == "localhost" || host == "127.0.0.1" || host == "::1" {
        return None;
    }
    if !host.contains('.') {
        return None;
    }

    Some(with_scheme)
}

fn normalize_sku(raw: &str) -> String {
    raw.to_uppercase()
}

/// Digits only, preserve leading zeros, reject < 3 digits.
fn normalize_upc(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 3 {
        None
    } else {
        Some(digits)
    }
}

fn parse_row(
    record: &csv::StringRecord,
    index: &HashMap<&'static str, usize>,
    row_number: u64,
) -> Result<ParsedProduct, RowError> {
    let name = get(record, index, "name").map(normalize_string);
    let url = get(record, index, "url").and_then(normalize_url);
    let price = get(record, index, "price").and_then(normalize_price);

    let name = match name {
        Some(n) if !n.is_empty() => n,
        _ => {
            return Err(RowError {
                row_number,
                code: "MISSING_NAME".into(),
                message: "required field 'name' missing or empty".into(),
            })
        }
    };
    let url = match url {
        Some(u) => u,
        None => {
            return Err(RowError {
                row_number,
                code: "INVALID_URL".into(),
                message: "required field 'url' missing or invalid".into(),
            })
        }
    };
    let price = match price {
        Some(p) => p,
        None => {
            return Err(RowError {
                row_number,
                code: "INVALID_PRICE".into(),
                message: "required field 'price' missing, non-numeric, or <= 0".into(),
            })
        }
    };

    let in_stock = get(record, index, "stock")
        .map(is_truthy_stock)
        .unwrap_or(true);

    Ok(ParsedProduct {
        name,
        url,
        price,
        network_item_id: get(record, index, "network_item_id").map(str::to_string),
        sku: get(record, index, "sku").map(normalize_sku),
        upc: get(record, index, "upc").and_then(normalize_upc),
        brand: get(record, index, "brand").map(normalize_string),
        category: get(record, index, "category").map(normalize_string),
        caliber: get(record, index, "caliber").map(normalize_string),
        grain_weight: get(record, index, "grain_weight").and_then(|v| Decimal::from_str(v).ok()),
        round_count: get(record, index, "round_count").and_then(|v| v.parse().ok()),
        description: get(record, index, "description").map(normalize_string),
        image_url: get(record, index, "image_url").and_then(normalize_url),
        in_stock,
        original_price: get(record, index, "original_price").and_then(normalize_price),
        currency: get(record, index, "currency")
            .map(|c| c.to_uppercase())
            .unwrap_or_else(|| "USD".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_id() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn parses_well_formed_rows() {
        let csv = "name,url,price,sku,caliber\nWidget,example.com/a,19.99,abc-1,9mm\n";
        let out = Parser::parse(csv.as_bytes(), 1000, feed_id()).unwrap();
        assert_eq!(out.rows_read, 1);
        assert_eq!(out.rows_parsed, 1);
        assert!(out.errors.is_empty());
        let p = &out.products[0];
        assert_eq!(p.name, "Widget");
        assert_eq!(p.url, "https://example.com/a");
        assert_eq!(p.price, Decimal::new(1999, 2));
        assert_eq!(p.sku.as_deref(), Some("ABC-1"));
    }

    #[test]
    fn strips_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"name,url,price\nWidget,example.com,5.00\n");
        let out = Parser::parse(&bytes, 1000, feed_id()).unwrap();
        assert_eq!(out.rows_parsed, 1);
    }

    #[test]
    fn header_lookup_is_case_insensitive_with_aliases() {
        let csv = "Title,Link,Cost\nThing,example.org,10\n";
        let out = Parser::parse(csv.as_bytes(), 1000, feed_id()).unwrap();
        assert_eq!(out.rows_parsed, 1);
        assert_eq!(out.products[0].name, "Thing");
    }

    #[test]
    fn tolerates_inconsistent_column_counts() {
        let csv = "name,url,price,sku\nA,example.com,1.00\nB,example.com,2.00,sku-b,extra\n";
        let out = Parser::parse(csv.as_bytes(), 1000, feed_id()).unwrap();
        assert_eq!(out.rows_read, 2);
        assert_eq!(out.rows_parsed, 2);
    }

    #[test]
    fn missing_required_fields_are_row_errors_not_fatal() {
        let csv = "name,url,price\n,example.com,5.00\nGood,example.com,5.00\n";
        let out = Parser::parse(csv.as_bytes(), 1000, feed_id()).unwrap();
        assert_eq!(out.rows_read, 2);
        assert_eq!(out.rows_parsed, 1);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].code, "MISSING_NAME");
    }

    #[test]
    fn price_must_be_positive() {
        let csv = "name,url,price\nA,example.com,0\nB,example.com,-5\n";
        let out = Parser::parse(csv.as_bytes(), 1000, feed_id()).unwrap();
        assert_eq!(out.rows_parsed, 0);
        assert_eq!(out.errors.len(), 2);
        assert!(out.errors.iter().all(|e| e.code == "INVALID_PRICE"));
    }

    #[test]
    fn url_without_scheme_is_forced_to_https() {
        assert_eq!(normalize_url("shop.example.com/item"), Some("https://shop.example.com/item".into()));
    }

    #[test]
    fn url_rejects_localhost_and_loopback_and_hostless() {
        assert_eq!(normalize_url("localhost/item"), None);
        assert_eq!(normalize_url("http://127.0.0.1/item"), None);
        assert_eq!(normalize_url(""), None);
        assert_eq!(normalize_url("http://nodothost/item"), None);
    }

    #[test]
    fn upc_preserves_leading_zeros_and_rejects_short_values() {
        assert_eq!(normalize_upc("012345"), Some("012345".into()));
        assert_eq!(normalize_upc("12"), None);
        assert_eq!(normalize_upc("ab-1-2-3"), Some("123".into()));
    }

    #[test]
    fn stock_alias_table_defaults_true_on_unrecognized() {
        assert!(is_truthy_stock("yes"));
        assert!(is_truthy_stock("in stock"));
        assert!(!is_truthy_stock("false"));
        assert!(!is_truthy_stock("0"));
        assert!(!is_truthy_stock("out of stock"));
    }

    #[test]
    fn too_many_rows_truncates_and_continues() {
        let mut csv = String::from("name,url,price\n");
        for i in 0..5 {
            csv.push_str(&format!("Item{i},example.com/{i},{}.00\n", i + 1));
        }
        let out = Parser::parse(csv.as_bytes(), 3, feed_id()).unwrap();
        assert_eq!(out.rows_read, 5);
        assert_eq!(out.rows_parsed, 3);
        assert!(out.errors.iter().any(|e| e.code == "TOO_MANY_ROWS"));
    }

    #[test]
    fn sku_is_uppercased() {
        let csv = "name,url,price,sku\nA,example.com,1.00,abc-123\n";
        let out = Parser::parse(csv.as_bytes(), 10, feed_id()).unwrap();
        assert_eq!(out.products[0].sku.as_deref(), Some("ABC-123"));
    }

    #[test]
    fn price_strips_currency_symbols() {
        assert_eq!(normalize_price("$1,234.567"), Some(Decimal::new(123457, 2)));
    }
}
