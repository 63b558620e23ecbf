//! Silence matching.
//!
//! A silence suppresses an alert when *all* of its matchers hold (AND
//! semantics). Regex operators are anchored to the full label value; a
//! label missing from the alert compares as the empty string.

use regex::Regex;

use crate::error::{Error, Result};
use crate::model::{Labels, MatchOp, Matcher};

/// A matcher list with its regexes compiled once, reused across every
/// evaluation tick the silence is live for.
#[derive(Debug)]
pub struct CompiledMatchers {
	matchers: Vec<CompiledMatcher>,
}

#[derive(Debug)]
enum CompiledMatcher {
	Eq { label: String, value: String },
	Ne { label: String, value: String },
	Re { label: String, re: Regex },
	NotRe { label: String, re: Regex },
}

impl CompiledMatchers {
	pub fn compile(matchers: &[Matcher]) -> Result<Self> {
		let compiled = matchers
			.iter()
			.map(|m| {
				Ok(match m.op {
					MatchOp::Eq => CompiledMatcher::Eq {
						label: m.label.clone(),
						value: m.value.clone(),
					},
					MatchOp::Ne => CompiledMatcher::Ne {
						label: m.label.clone(),
						value: m.value.clone(),
					},
					MatchOp::Re => CompiledMatcher::Re {
						label: m.label.clone(),
						re: anchored(&m.value)?,
					},
					MatchOp::NotRe => CompiledMatcher::NotRe {
						label: m.label.clone(),
						re: anchored(&m.value)?,
					},
				})
			})
			.collect::<Result<Vec<_>>>()?;

		Ok(Self { matchers: compiled })
	}

	/// AND across all matchers. An empty matcher list never matches.
	pub fn matches(&self, labels: &Labels) -> bool {
		if self.matchers.is_empty() {
			return false;
		}

		self.matchers.iter().all(|matcher| {
			let get = |label: &str| labels.get(label).map(String::as_str).unwrap_or("");
			match matcher {
				CompiledMatcher::Eq { label, value } => get(label) == value,
				CompiledMatcher::Ne { label, value } => get(label) != value,
				CompiledMatcher::Re { label, re } => re.is_match(get(label)),
				CompiledMatcher::NotRe { label, re } => !re.is_match(get(label)),
			}
		})
	}
}

fn anchored(pattern: &str) -> Result<Regex> {
	Regex::new(&format!("^(?:{pattern})$"))
		.map_err(|err| Error::Config(format!("invalid matcher regex {pattern:?}: {err}")))
}

/// Validation used by the CRUD collaborators before persisting a silence:
/// non-empty list, known operators (guaranteed by the type), compilable
/// regexes, non-empty label names.
pub fn validate_matchers(matchers: &[Matcher]) -> Result<()> {
	if matchers.is_empty() {
		return Err(Error::Config("matchers must not be empty".into()));
	}

	for (idx, matcher) in matchers.iter().enumerate() {
		if matcher.label.is_empty() {
			return Err(Error::Config(format!("matcher[{idx}] has an empty label")));
		}
		if matches!(matcher.op, MatchOp::Re | MatchOp::NotRe) {
			anchored(&matcher.value)
				.map_err(|err| Error::Config(format!("matcher[{idx}]: {err}")))?;
		}
	}

	Ok(())
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

	fn matcher(label: &str, op: MatchOp, value: &str) -> Matcher {
		Matcher {
			label: label.into(),
			op,
			value: value.into(),
		}
	}

	#[test]
	fn and_semantics_across_matchers() {
		let alert = labels(&[("severity", "warning"), ("team", "db")]);
		let compiled = CompiledMatchers::compile(&[
			matcher("severity", MatchOp::Re, "warn.*"),
			matcher("team", MatchOp::Ne, "web"),
		])
		.unwrap();
		assert!(compiled.matches(&alert));

		// Flipping either matcher falsifies the result.
		let compiled = CompiledMatchers::compile(&[
			matcher("severity", MatchOp::Re, "crit.*"),
			matcher("team", MatchOp::Ne, "web"),
		])
		.unwrap();
		assert!(!compiled.matches(&alert));

		let compiled = CompiledMatchers::compile(&[
			matcher("severity", MatchOp::Re, "warn.*"),
			matcher("team", MatchOp::Ne, "db"),
		])
		.unwrap();
		assert!(!compiled.matches(&alert));
	}

	#[test]
	fn empty_matcher_list_never_matches() {
		let compiled = CompiledMatchers::compile(&[]).unwrap();
		assert!(!compiled.matches(&labels(&[("a", "b")])));
	}

	#[test]
	fn missing_label_is_empty_string() {
		let alert = labels(&[("team", "db")]);

		// "" != "x" holds, so != on a missing label matches.
		let compiled =
			CompiledMatchers::compile(&[matcher("env", MatchOp::Ne, "prod")]).unwrap();
		assert!(compiled.matches(&alert));

		// A regex that admits the empty string matches a missing label too.
		let compiled =
			CompiledMatchers::compile(&[matcher("env", MatchOp::Re, ".*")]).unwrap();
		assert!(compiled.matches(&alert));
	}

	#[test]
	fn regex_is_anchored_to_the_full_value() {
		let alert = labels(&[("instance", "web-1-prod")]);
		let compiled =
			CompiledMatchers::compile(&[matcher("instance", MatchOp::Re, "web")]).unwrap();
		assert!(!compiled.matches(&alert));

		let compiled =
			CompiledMatchers::compile(&[matcher("instance", MatchOp::Re, "web.*")]).unwrap();
		assert!(compiled.matches(&alert));
	}

	#[test]
	fn validation_rejects_bad_input() {
		assert!(validate_matchers(&[]).is_err());
		assert!(validate_matchers(&[matcher("a", MatchOp::Re, "([")]).is_err());
		assert!(validate_matchers(&[matcher("", MatchOp::Eq, "x")]).is_err());
		assert!(validate_matchers(&[matcher("a", MatchOp::Eq, "x")]).is_ok());
	}
}
