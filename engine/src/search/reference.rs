//! Reference block formatting

use super::{CitationConfig, Reference, ReferenceContext, SearchResult};

/// Instructions prepended to the reference block
pub const DEFAULT_CITATION_PROMPT: &str = r#"You are given reference material inside a <references> block. Each <ref> element has these attributes:
- id: Citation identifier, a simple integer
- type: Data type of the reference (web, kb, db)
- weight: Relevance weight between 0 and 1; higher means more trustworthy
- source: Origin of the reference (user, hook, auto)

When a statement in your answer relies on a reference, cite it inline right after the statement using an anchor:
<a class="ref" data-ref-id="1" data-ref-type="web">[1]</a>

Rules:
- Only cite references that actually support the statement.
- Prefer references with a higher weight when they disagree.
- Do not invent references or ids that are not present in the block.
- If the references do not help, answer normally without citations."#;

/// Flatten search results into references, in result order
pub fn build_references(results: &[SearchResult]) -> Vec<Reference> {
    let mut references = Vec::new();
    for result in results {
        for item in &result.items {
            let id = if item.citation_id.is_empty() {
                (references.len() + 1).to_string()
            } else {
                item.citation_id.clone()
            };
            references.push(Reference {
                id,
                kind: item.kind,
                source: item.source,
                weight: item.weight,
                score: item.score,
                title: item.title.clone(),
                content: item.content.clone(),
                url: item.url.clone().filter(|u| !u.is_empty()),
            });
        }
    }
    references
}

/// Render references as a `<references>` block
///
/// An empty slice renders as an empty string.
pub fn format_references_xml(references: &[Reference]) -> String {
    if references.is_empty() {
        return String::new();
    }

    let mut xml = String::from("<references>\n");
    for r in references {
        xml.push_str(&format!(
            "<ref id=\"{}\" type=\"{}\" weight=\"{:.1}\" source=\"{}\">\n",
            escape_attr(&r.id),
            r.kind.as_str(),
            r.weight,
            r.source.as_str()
        ));
        if !r.title.is_empty() {
            xml.push_str(&r.title);
            xml.push('\n');
        }
        if !r.content.is_empty() {
            xml.push_str(&r.content);
            xml.push('\n');
        }
        if let Some(url) = &r.url {
            xml.push_str("URL: ");
            xml.push_str(url);
            xml.push('\n');
        }
        xml.push_str("</ref>\n");
    }
    xml.push_str("</references>");
    xml
}

/// Citation instructions; a non-empty custom prompt replaces the default
pub fn citation_prompt(config: Option<&CitationConfig>) -> String {
    config
        .and_then(|c| c.custom_prompt.as_deref())
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_CITATION_PROMPT)
        .to_string()
}

/// References, their XML block and the citation prompt
pub fn build_reference_context(
    results: &[SearchResult],
    citation: Option<&CitationConfig>,
) -> ReferenceContext {
    let references = build_references(results);
    let xml = format_references_xml(&references);
    ReferenceContext {
        references,
        xml,
        prompt: citation_prompt(citation),
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{ResultItem, SearchType, SourceType};

    fn reference(id: &str, kind: SearchType, source: SourceType, weight: f64) -> Reference {
        Reference {
            id: id.to_string(),
            kind,
            source,
            weight,
            score: 0.0,
            title: String::new(),
            content: format!("Content {}", id),
            url: None,
        }
    }

    #[test]
    fn test_xml_structure() {
        let mut r = reference("1", SearchType::Web, SourceType::User, 1.0);
        r.title = "Title".into();
        r.url = Some("https://example.com".into());

        let xml = format_references_xml(&[r]);
        assert!(xml.starts_with("<references>\n"));
        assert!(xml.ends_with("</references>"));
        assert!(xml.contains(r#"<ref id="1" type="web" weight="1.0" source="user">"#));
        assert!(xml.contains("</ref>\n"));
        assert!(xml.contains("URL: https://example.com"));
    }

    #[test]
    fn test_url_line_only_when_present() {
        let xml = format_references_xml(&[
            reference("1", SearchType::Kb, SourceType::Hook, 0.8),
            reference("2", SearchType::Db, SourceType::Auto, 0.6),
        ]);
        assert!(xml.contains(r#"<ref id="1" type="kb" weight="0.8" source="hook">"#));
        assert!(xml.contains(r#"<ref id="2" type="db" weight="0.6" source="auto">"#));
        assert!(!xml.contains("URL:"));
    }

    #[test]
    fn test_empty_results() {
        let ctx = build_reference_context(&[], None);
        assert!(ctx.references.is_empty());
        assert!(ctx.xml.is_empty());
        assert_eq!(ctx.prompt, DEFAULT_CITATION_PROMPT);
    }

    #[test]
    fn test_references_keep_result_order() {
        let results = vec![
            SearchResult {
                kind: SearchType::Web,
                query: "q".into(),
                source: SourceType::Auto,
                items: vec![ResultItem {
                    citation_id: "1".into(),
                    ..ResultItem::new(SearchType::Web, "", "web")
                }],
                duration_ms: 0,
                error: None,
            },
            SearchResult {
                kind: SearchType::Kb,
                query: "q".into(),
                source: SourceType::Auto,
                items: vec![ResultItem {
                    citation_id: "2".into(),
                    ..ResultItem::new(SearchType::Kb, "", "kb")
                }],
                duration_ms: 0,
                error: None,
            },
        ];
        let refs = build_references(&results);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].content, "web");
        assert_eq!(refs[1].id, "2");
    }

    #[test]
    fn test_citation_prompt_override() {
        assert_eq!(citation_prompt(None), DEFAULT_CITATION_PROMPT);
        let empty = CitationConfig {
            custom_prompt: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(citation_prompt(Some(&empty)), DEFAULT_CITATION_PROMPT);
        let custom = CitationConfig {
            custom_prompt: Some("Cite as [n]".into()),
            format: Some("[{id}]".into()),
        };
        assert_eq!(citation_prompt(Some(&custom)), "Cite as [n]");
    }

    #[test]
    fn test_default_prompt_mentions_attributes() {
        for needle in [
            "<references>",
            "id: Citation identifier",
            "type: Data type",
            "weight: Relevance weight",
            "source: Origin",
            r#"<a class="ref""#,
            "data-ref-type",
            r#"data-ref-id="1""#,
        ] {
            assert!(DEFAULT_CITATION_PROMPT.contains(needle), "missing {}", needle);
        }
    }
}
