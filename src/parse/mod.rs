//! Content parser collaborator interface
//!
//! Like the HTTP transport, parsing is a collaborator concern: the runtime
//! never interprets response bodies itself. Implementations (an HTML parser,
//! an XML reader, a JSON extractor) live outside the crate; middlewares and
//! handlers consume them through this trait to extract links and match
//! selectors.

use anyhow::Result;

/// Abstract content parser.
pub trait Parser: Send + Sync {
    /// Parsed document representation.
    type Output;

    /// Parse raw response bytes into a document.
    fn parse(&self, bytes: &[u8]) -> Result<Self::Output>;

    /// Extract link targets matching `selector` from a parsed document.
    fn find_links(&self, parsed: &Self::Output, selector: &str) -> Result<Vec<String>>;

    /// Whether any element of the parsed document matches `selector`.
    fn is_matching(&self, parsed: &Self::Output, selector: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Toy parser over `key: value` lines, enough to exercise the contract.
    struct LineParser;

    impl Parser for LineParser {
        type Output = Vec<(String, String)>;

        fn parse(&self, bytes: &[u8]) -> Result<Self::Output> {
            let text = std::str::from_utf8(bytes)?;
            Ok(text
                .lines()
                .filter_map(|line| {
                    line.split_once(':')
                        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                })
                .collect())
        }

        fn find_links(&self, parsed: &Self::Output, selector: &str) -> Result<Vec<String>> {
            Ok(parsed
                .iter()
                .filter(|(key, _)| key == selector)
                .map(|(_, value)| value.clone())
                .collect())
        }

        fn is_matching(&self, parsed: &Self::Output, selector: &str) -> Result<bool> {
            Ok(parsed.iter().any(|(key, _)| key == selector))
        }
    }

    #[test]
    fn parse_and_extract_links() {
        let parser = LineParser;
        let parsed = parser
            .parse(b"link: /a\nlink: /b\ntitle: hello")
            .expect("parses");
        assert_eq!(
            parser.find_links(&parsed, "link").expect("links"),
            vec!["/a".to_string(), "/b".to_string()]
        );
        assert!(parser.is_matching(&parsed, "title").expect("match"));
        assert!(!parser.is_matching(&parsed, "script").expect("match"));
    }
}
