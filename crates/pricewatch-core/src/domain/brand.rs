//! Brand resolution and product-page URLs.

use url::Url;

/// Brands the target site lists under `/products/<brand>/`.
pub const SUPPORTED_BRANDS: [&str; 3] = ["JOHN DEERE", "CLAAS", "MANITOU"];

/// Maps a raw brand cell to the site's brand code.
///
/// Returns `None` for brands the site does not carry; such rows are skipped,
/// never queued.
pub fn resolve_brand_code(raw: &str) -> Option<&'static str> {
    let brand = raw.trim().to_uppercase();
    if brand.is_empty() {
        return None;
    }
    if brand.contains("JOHN") && brand.contains("DEERE") {
        return Some(SUPPORTED_BRANDS[0]);
    }
    SUPPORTED_BRANDS[1..]
        .iter()
        .copied()
        .find(|code| *code == brand)
}

/// `<base>/products/<brand>/<part>.html`, each segment percent-encoded.
pub fn product_url(base: &Url, brand_code: &str, part_number: &str) -> Option<Url> {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .ok()?
        .clear()
        .push("products")
        .push(brand_code)
        .push(&format!("{}.html", part_number.trim()));
    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::john_deere("John Deere", Some("JOHN DEERE"))]
    #[case::john_deere_spaced("  JOHN  DEERE ", Some("JOHN DEERE"))]
    #[case::claas("claas", Some("CLAAS"))]
    #[case::manitou("Manitou", Some("MANITOU"))]
    #[case::unsupported("KUBOTA", None)]
    #[case::partial("CLAAS AGRO", None)]
    #[case::empty("   ", None)]
    fn resolves_brand_codes(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(resolve_brand_code(raw), expected);
    }

    #[test]
    fn product_url_encodes_brand_and_part() {
        let base = Url::parse("https://partsbooking.ru").unwrap();
        let url = product_url(&base, "JOHN DEERE", " RE 504836 ").unwrap();
        assert_eq!(
            url.as_str(),
            "https://partsbooking.ru/products/JOHN%20DEERE/RE%20504836.html"
        );
    }

    #[test]
    fn product_url_escapes_slashes_in_part() {
        let base = Url::parse("https://partsbooking.ru/").unwrap();
        let url = product_url(&base, "CLAAS", "000/123").unwrap();
        assert_eq!(url.path(), "/products/CLAAS/000%2F123.html");
    }
}
