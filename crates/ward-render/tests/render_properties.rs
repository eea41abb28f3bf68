//! Property tests for rendering determinism and text fidelity.

use std::collections::BTreeMap;

use proptest::prelude::*;
use ward_render::{ParseOptions, RenderOptions, Template, MISSING_VALUE};

fn key_path() -> impl Strategy<Value = String> {
    "[a-z]{1,8}(/[a-z0-9_]{1,8}){0,3}"
}

fn value_map() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map(key_path(), "[ -~\n]{0,24}", 0..8)
}

/// Text that cannot contain an action opener.
fn plain_text() -> impl Strategy<Value = String> {
    "[^{]{0,64}"
}

proptest! {
    #[test]
    fn rendering_is_deterministic(
        values in value_map(),
        keys in prop::collection::vec(key_path(), 1..6),
        separator in plain_text(),
        strict in any::<bool>(),
    ) {
        let source: String = keys
            .iter()
            .map(|k| format!("{{{{ key \"{k}\" }}}}"))
            .collect::<Vec<_>>()
            .join(&separator);
        let template = Template::parse(&source, &ParseOptions::default()).expect("parse");
        let options = RenderOptions { error_on_missing_key: strict };

        let first = template.render(&values, options);
        let second = template.render(&values, options);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn text_without_actions_round_trips(text in plain_text()) {
        let template = Template::parse(&text, &ParseOptions::default()).expect("parse");
        let rendered = template
            .render(&BTreeMap::new(), RenderOptions::default())
            .expect("render");
        prop_assert_eq!(rendered.contents, text.into_bytes());
    }

    #[test]
    fn present_keys_render_verbatim(
        prefix in plain_text(),
        suffix in plain_text(),
        value in "[ -~\n]{0,32}",
    ) {
        let source = format!("{prefix}{{{{ key \"config/value\" }}}}{suffix}");
        let template = Template::parse(&source, &ParseOptions::default()).expect("parse");
        let values = BTreeMap::from([("config/value".to_string(), value.clone())]);
        let rendered = template
            .render(&values, RenderOptions { error_on_missing_key: true })
            .expect("render");
        prop_assert_eq!(rendered.contents, format!("{prefix}{value}{suffix}").into_bytes());
    }

    #[test]
    fn lenient_render_reports_exactly_the_absent_keys(
        values in value_map(),
        keys in prop::collection::btree_set(key_path(), 1..6),
    ) {
        let source: String = keys.iter().map(|k| format!("{{{{ key \"{k}\" }}}}\n")).collect();
        let template = Template::parse(&source, &ParseOptions::default()).expect("parse");
        let rendered = template
            .render(&values, RenderOptions::default())
            .expect("render");

        let expected_missing: Vec<String> = keys
            .iter()
            .filter(|k| !values.contains_key(*k))
            .cloned()
            .collect();
        prop_assert_eq!(&rendered.missing, &expected_missing);

        let text = String::from_utf8(rendered.contents).expect("utf8");
        prop_assert_eq!(text.matches(MISSING_VALUE).count() >= expected_missing.len(), true);
    }
}
