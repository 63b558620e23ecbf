//! Annotation template rendering.
//!
//! A deliberately small substitution engine recognising exactly four
//! patterns, whitespace-insensitive inside the braces:
//!
//! - `{{ $value }}` / `{{ .value }}` — the triggering sample value
//! - `{{ $labels.X }}` / `{{ .labels.X }}` — an effective label
//!
//! Unknown labels substitute the literal `<未定义:X>` placeholder so broken
//! templates stay visible in the delivered notification.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::model::Labels;

static VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"\{\{\s*[$.]value\s*\}\}").expect("value pattern is valid")
});

static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"\{\{\s*[$.]labels\.(\w+)\s*\}\}").expect("label pattern is valid")
});

pub fn render(template: &str, labels: &Labels, value: f64) -> String {
	let rendered = VALUE_RE.replace_all(template, value.to_string().as_str());
	LABEL_RE
		.replace_all(&rendered, |caps: &Captures<'_>| {
			let key = &caps[1];
			labels
				.get(key)
				.cloned()
				.unwrap_or_else(|| format!("<未定义:{key}>"))
		})
		.into_owned()
}

/// Render every annotation of a rule against an alert's labels and value.
pub fn render_annotations(
	annotations: &BTreeMap<String, String>,
	labels: &Labels,
	value: f64,
) -> BTreeMap<String, String> {
	annotations
		.iter()
		.map(|(key, template)| (key.clone(), render(template, labels, value)))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn labels(pairs: &[(&str, &str)]) -> Labels {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect()
	}

	#[test]
	fn renders_value_in_both_spellings() {
		let l = Labels::new();
		assert_eq!(render("v={{ $value }}", &l, 5.0), "v=5");
		assert_eq!(render("v={{.value}}", &l, 2.5), "v=2.5");
		assert_eq!(render("v={{  $value  }}", &l, 0.0), "v=0");
	}

	#[test]
	fn renders_labels_in_both_spellings() {
		let l = labels(&[("instance", "a")]);
		assert_eq!(
			render("host {{ $labels.instance }}", &l, 1.0),
			"host a"
		);
		assert_eq!(render("host {{.labels.instance}}", &l, 1.0), "host a");
	}

	#[test]
	fn missing_label_yields_placeholder() {
		let l = Labels::new();
		assert_eq!(
			render("host {{ $labels.instance }}", &l, 1.0),
			"host <未定义:instance>"
		);
	}

	#[test]
	fn plain_text_passes_through() {
		let l = labels(&[("a", "b")]);
		assert_eq!(render("no templates here", &l, 1.0), "no templates here");
	}

	#[test]
	fn renders_all_annotations() {
		let mut annotations = BTreeMap::new();
		annotations.insert(
			"summary".to_string(),
			"cpu on {{ $labels.instance }} at {{ $value }}".to_string(),
		);
		annotations.insert("runbook".to_string(), "https://wiki/cpu".to_string());

		let rendered =
			render_annotations(&annotations, &labels(&[("instance", "a")]), 93.5);
		assert_eq!(rendered["summary"], "cpu on a at 93.5");
		assert_eq!(rendered["runbook"], "https://wiki/cpu");
	}
}
