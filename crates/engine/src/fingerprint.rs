use crate::model::Labels;

/// Merge datasource extras, series labels, and rule labels into the
/// effective label set. Later sources win on key collisions.
pub fn effective_labels(extra: &Labels, series: &Labels, rule: &Labels) -> Labels {
	let mut labels = extra.clone();
	labels.extend(series.iter().map(|(k, v)| (k.clone(), v.clone())));
	labels.extend(rule.iter().map(|(k, v)| (k.clone(), v.clone())));
	labels
}

/// Deterministic identity of a (rule, label-set) pair.
///
/// `hex(md5(rule_id ":" k1 "=" v1 "," k2 "=" v2 ...))` over the labels in
/// sorted key order. md5 is kept for compatibility with historical event
/// rows; swapping the hash would orphan them.
pub fn fingerprint(rule_id: i64, labels: &Labels) -> String {
	let label_str = labels
		.iter()
		.map(|(k, v)| format!("{k}={v}"))
		.collect::<Vec<_>>()
		.join(",");
	format!("{:x}", md5::compute(format!("{rule_id}:{label_str}")))
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
	fn fingerprint_is_independent_of_insertion_order() {
		let mut a = Labels::new();
		a.insert("instance".into(), "a".into());
		a.insert("severity".into(), "critical".into());

		let mut b = Labels::new();
		b.insert("severity".into(), "critical".into());
		b.insert("instance".into(), "a".into());

		assert_eq!(fingerprint(1, &a), fingerprint(1, &b));
	}

	#[test]
	fn fingerprint_is_stable_across_evaluations() {
		let l = labels(&[("instance", "a")]);
		let first = fingerprint(7, &l);
		assert_eq!(first, fingerprint(7, &l));
		assert_eq!(first.len(), 32);
		assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
	}

	#[test]
	fn fingerprint_differs_per_rule() {
		let l = labels(&[("instance", "a")]);
		assert_ne!(fingerprint(1, &l), fingerprint(2, &l));
	}

	#[test]
	fn later_label_sources_win() {
		let extra = labels(&[("env", "staging"), ("region", "eu")]);
		let series = labels(&[("env", "prod")]);
		let rule = labels(&[("severity", "critical")]);

		let merged = effective_labels(&extra, &series, &rule);
		assert_eq!(merged.get("env").map(String::as_str), Some("prod"));
		assert_eq!(merged.get("region").map(String::as_str), Some("eu"));
		assert_eq!(
			merged.get("severity").map(String::as_str),
			Some("critical")
		);
	}
}
