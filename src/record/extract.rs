//! Reference HTML product extractor.
//!
//! Pulls the handful of fields most product pages expose through standard
//! markup (title tag, Open Graph metadata, itemprop annotations). Site
//! fleets ship their own extractors; this one exists so the crawl plumbing
//! can be exercised end to end without site-specific code.

use scraper::{Html, Selector};
use serde_json::{Map, Value};

use super::{Extraction, ProductRecord, SiteExtractor};
use crate::fetch::FetchResponse;

pub struct HtmlProductExtractor;

impl HtmlProductExtractor {
    fn select_first(document: &Html, selector: &str) -> Option<String> {
        let selector = Selector::parse(selector).ok()?;
        document
            .select(&selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|text| !text.is_empty())
    }

    fn select_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
        let selector = Selector::parse(selector).ok()?;
        document
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr(attr))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

impl SiteExtractor for HtmlProductExtractor {
    fn parse(&self, response: &FetchResponse, _record: Option<&ProductRecord>) -> Extraction {
        let body = String::from_utf8_lossy(&response.body);
        let document = Html::parse_document(&body);

        let mut fields = Map::new();

        let title = Self::select_attr(&document, r#"meta[property="og:title"]"#, "content")
            .or_else(|| Self::select_first(&document, "title"));
        if let Some(title) = title {
            fields.insert("title".to_string(), Value::String(title));
        }

        if let Some(price) = Self::select_attr(&document, r#"[itemprop="price"]"#, "content")
            .or_else(|| Self::select_first(&document, r#"[itemprop="price"]"#))
        {
            fields.insert("price".to_string(), Value::String(price));
        }

        if let Some(brand) = Self::select_first(&document, r#"[itemprop="brand"]"#) {
            fields.insert("brand".to_string(), Value::String(brand));
        }

        if let Some(image) = Self::select_attr(&document, r#"meta[property="og:image"]"#, "content")
        {
            fields.insert("image_url".to_string(), Value::String(image));
        }

        Extraction {
            fields,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_body(body: &str) -> FetchResponse {
        FetchResponse {
            url: "https://acme.test/p/1".to_string(),
            status: 200,
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
            from_cache: false,
        }
    }

    #[test]
    fn test_extracts_title_and_price() {
        let response = response_with_body(
            r#"<html><head><title>Widget Deluxe</title></head>
            <body><span itemprop="price">19.99</span></body></html>"#,
        );
        let extraction = HtmlProductExtractor.parse(&response, None);
        assert_eq!(extraction.fields["title"], "Widget Deluxe");
        assert_eq!(extraction.fields["price"], "19.99");
        assert!(extraction.sub_fetches.is_empty());
    }

    #[test]
    fn test_og_title_preferred_over_title_tag() {
        let response = response_with_body(
            r#"<html><head>
            <title>Acme Store - Widget</title>
            <meta property="og:title" content="Widget Deluxe"/>
            </head><body></body></html>"#,
        );
        let extraction = HtmlProductExtractor.parse(&response, None);
        assert_eq!(extraction.fields["title"], "Widget Deluxe");
    }

    #[test]
    fn test_empty_page_yields_no_fields() {
        let response = response_with_body("<html><body></body></html>");
        let extraction = HtmlProductExtractor.parse(&response, None);
        assert!(extraction.is_empty());
    }
}
