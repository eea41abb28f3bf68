//! Parsed templates and rendering.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{RenderError, RenderResult};
use crate::parse::{self, Node, ParseOptions};

/// Text emitted for a missing key when the template is not strict.
pub const MISSING_VALUE: &str = "<no value>";

/// Source of key values for a render.
pub trait Lookup {
    /// Returns the value stored at `key`, if any.
    fn lookup(&self, key: &str) -> Option<&str>;
}

impl Lookup for BTreeMap<String, String> {
    fn lookup(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

impl Lookup for HashMap<String, String> {
    fn lookup(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

/// Options applied at render time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Fail instead of emitting [`MISSING_VALUE`] for absent keys.
    pub error_on_missing_key: bool,
}

/// Output of a successful render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// Rendered bytes.
    pub contents: Vec<u8>,
    /// Keys that were absent and replaced by [`MISSING_VALUE`].
    pub missing: Vec<String>,
}

/// A parsed template, ready to render any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    /// Parses template source.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Syntax`] if the source is malformed.
    pub fn parse(source: &str, options: &ParseOptions) -> RenderResult<Self> {
        Ok(Self {
            nodes: parse::parse(source, options)?,
        })
    }

    /// Every key path this template reads, sorted and de-duplicated.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Key { path, .. } => Some(path.clone()),
                Node::Text(_) | Node::Literal(_) => None,
            })
            .collect()
    }

    /// Renders the template against `values`.
    ///
    /// The output depends only on the template and the values, so equal
    /// inputs always produce identical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::MissingKey`] for the first absent key when
    /// `error_on_missing_key` is set. Keys with a default never fail.
    pub fn render<L: Lookup + ?Sized>(
        &self,
        values: &L,
        options: RenderOptions,
    ) -> RenderResult<Rendered> {
        let mut out = String::new();
        let mut missing = Vec::new();

        for node in &self.nodes {
            match node {
                Node::Text(text) | Node::Literal(text) => out.push_str(text),
                Node::Key { path, default } => match (values.lookup(path), default) {
                    (Some(value), _) => out.push_str(value),
                    (None, Some(default)) => out.push_str(default),
                    (None, None) if options.error_on_missing_key => {
                        return Err(RenderError::MissingKey { key: path.clone() });
                    }
                    (None, None) => {
                        out.push_str(MISSING_VALUE);
                        if !missing.contains(path) {
                            missing.push(path.clone());
                        }
                    }
                },
            }
        }

        Ok(Rendered {
            contents: out.into_bytes(),
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn region_template() -> Template {
        Template::parse(
            "cluster_name = \"{{ keyOrDefault \"config/services/consul/datacenter\" \"unknown\" }}\"\n",
            &ParseOptions::default(),
        )
        .expect("parse")
    }

    #[test]
    fn renders_present_value() {
        let rendered = region_template()
            .render(
                &values(&[("config/services/consul/datacenter", "eu-west")]),
                RenderOptions::default(),
            )
            .expect("render");
        assert_eq!(rendered.contents, b"cluster_name = \"eu-west\"\n".to_vec());
        assert!(rendered.missing.is_empty());
    }

    #[test]
    fn renders_default_when_absent_even_if_strict() {
        let rendered = region_template()
            .render(
                &values(&[]),
                RenderOptions {
                    error_on_missing_key: true,
                },
            )
            .expect("render");
        assert_eq!(rendered.contents, b"cluster_name = \"unknown\"\n".to_vec());
    }

    #[test]
    fn strict_template_fails_on_missing_key() {
        let template =
            Template::parse("region = {{ key \"region\" }}", &ParseOptions::default())
                .expect("parse");
        let err = template
            .render(
                &values(&[]),
                RenderOptions {
                    error_on_missing_key: true,
                },
            )
            .expect_err("missing");
        assert_eq!(
            err,
            RenderError::MissingKey {
                key: "region".to_string()
            }
        );
    }

    #[test]
    fn lenient_template_emits_marker() {
        let template = Template::parse(
            "a={{ key \"a\" }} b={{ key \"a\" }}",
            &ParseOptions::default(),
        )
        .expect("parse");
        let rendered = template
            .render(&values(&[]), RenderOptions::default())
            .expect("render");
        assert_eq!(
            String::from_utf8(rendered.contents).expect("utf8"),
            "a=<no value> b=<no value>"
        );
        assert_eq!(rendered.missing, vec!["a".to_string()]);
    }

    #[test]
    fn trailing_newline_is_preserved_exactly() {
        let options = ParseOptions::default();
        let vals = values(&[("k", "v")]);

        for (source, expected) in [
            ("x={{ key \"k\" }}", "x=v"),
            ("x={{ key \"k\" }}\n", "x=v\n"),
            ("x={{ key \"k\" }}\n\n", "x=v\n\n"),
            ("x={{ key \"k\" }}\r\n", "x=v\r\n"),
        ] {
            let rendered = Template::parse(source, &options)
                .expect("parse")
                .render(&vals, RenderOptions::default())
                .expect("render");
            assert_eq!(rendered.contents, expected.as_bytes(), "source {source:?}");
        }
    }

    #[test]
    fn values_with_newlines_are_not_altered() {
        let template = Template::parse("{{ key \"k\" }}", &ParseOptions::default())
            .expect("parse");
        let rendered = template
            .render(&values(&[("k", "line1\nline2\n")]), RenderOptions::default())
            .expect("render");
        assert_eq!(rendered.contents, b"line1\nline2\n".to_vec());
    }

    #[test]
    fn dependencies_are_sorted_and_unique() {
        let options = ParseOptions {
            vars: BTreeMap::from([("value".to_string(), "region".to_string())]),
            ..ParseOptions::default()
        };
        let template = Template::parse(
            "{{ key \"b\" }}{{ value }}{{ keyOrDefault \"a\" \"x\" }}{{ key \"b\" }}{{ \"lit\" }}",
            &options,
        )
        .expect("parse");
        let deps: Vec<String> = template.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["a", "b", "region"]);
    }

    #[test]
    fn hash_map_lookup() {
        let template = Template::parse("{{ key \"k\" }}", &ParseOptions::default())
            .expect("parse");
        let map: HashMap<String, String> = HashMap::from([("k".to_string(), "v".to_string())]);
        let rendered = template
            .render(&map, RenderOptions::default())
            .expect("render");
        assert_eq!(rendered.contents, b"v".to_vec());
    }
}
