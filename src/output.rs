//! Extraction of numeric fields from a job's captured output.
//!
//! A grammar mixes named fields with literal separators: `{gen} {nfe}` (or
//! the bare form `gen nfe`) names two fields separated by a space. Matching
//! walks the grammar left to right over the remaining text:
//!
//! - a field takes the first number found (sign, fraction and exponent
//!   allowed) and consumes the text up to the end of it;
//! - a separator must appear somewhere in the remaining text and consumes
//!   through its end.
//!
//! Any miss means the output does not match the grammar.

use std::collections::BTreeMap;

use crate::error::GrammarError;
use crate::pattern::{GRAMMAR_TOKEN, NUMBER};

/// Field name to value, as extracted from one run.
pub type Record = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Field(String),
    Separator(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputGrammar {
    parts: Vec<Part>,
}

impl OutputGrammar {
    pub fn parse(grammar: &str) -> Result<Self, GrammarError> {
        let mut parts = Vec::new();

        for caps in GRAMMAR_TOKEN.captures_iter(grammar) {
            if let Some(inner) = caps.get(1) {
                let name = inner.as_str().trim();
                if name.is_empty() {
                    return Err(GrammarError::EmptyField(inner.start() - 1));
                }
                parts.push(Part::Field(name.to_string()));
            } else if let Some(name) = caps.get(2) {
                parts.push(Part::Field(name.as_str().to_string()));
            } else if let Some(sep) = caps.get(3) {
                // A brace that did not pair up with a closing one.
                if sep.as_str() == "{" {
                    return Err(GrammarError::UnclosedField(sep.start()));
                }
                parts.push(Part::Separator(sep.as_str().to_string()));
            }
        }

        Ok(Self { parts })
    }

    /// Names of the fields in grammar order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Part::Field(name) => Some(name.as_str()),
            Part::Separator(_) => None,
        })
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields().any(|f| f == name)
    }

    /// Match `output` against the grammar. `None` when it does not fit.
    pub fn extract(&self, output: &str) -> Option<Record> {
        let mut record = Record::new();
        let mut rest = output;

        for part in &self.parts {
            match part {
                Part::Field(name) => {
                    let Some(number) = NUMBER.find(rest) else {
                        tracing::debug!(field = %name, "Field not matched with any value");
                        return None;
                    };
                    let value: f64 = number.as_str().parse().ok()?;
                    tracing::debug!(field = %name, value, "Field parsed");
                    record.insert(name.clone(), value);
                    rest = &rest[number.end()..];
                }
                Part::Separator(sep) => {
                    let Some(idx) = rest.find(sep.as_str()) else {
                        tracing::debug!(separator = ?sep, "Separator not matched");
                        return None;
                    };
                    rest = &rest[idx + sep.len()..];
                }
            }
        }

        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn braced_fields_and_separator() {
        let grammar = OutputGrammar::parse("{a} {b}").unwrap();
        let record = grammar.extract("3 42.5").unwrap();
        assert_eq!(record["a"], 3.0);
        assert_eq!(record["b"], 42.5);
        assert_eq!(grammar.fields().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn bare_field_names() {
        let grammar = OutputGrammar::parse("gen,nfe").unwrap();
        let record = grammar.extract("gen=12, nfe=3.5e4").unwrap();
        // The first number after the start is the 12; the comma separator
        // is then found and nfe takes the next number.
        assert_eq!(record["gen"], 12.0);
        assert_eq!(record["nfe"], 35000.0);
    }

    #[test]
    fn numbers_skip_leading_text() {
        let grammar = OutputGrammar::parse("{x}\n{y}").unwrap();
        let record = grammar.extract("header line\nvalue -7\nnext +.25\n").unwrap();
        assert_eq!(record["x"], -7.0);
        assert_eq!(record["y"], 0.25);
    }

    #[test]
    fn missing_separator_is_no_match() {
        let grammar = OutputGrammar::parse("{a};{b}").unwrap();
        assert!(grammar.extract("1 2").is_none());
    }

    #[test]
    fn missing_number_is_no_match() {
        let grammar = OutputGrammar::parse("{a} {b}").unwrap();
        assert!(grammar.extract("5 done").is_none());
    }

    #[test]
    fn number_forms() {
        let first = |s: &str| NUMBER.find(s).map(|m| m.as_str().to_string());
        assert_eq!(first("5. rest").as_deref(), Some("5"));
        assert_eq!(first("1e next").as_deref(), Some("1"));
        assert_eq!(first("1.e5").as_deref(), Some("1"));
        assert_eq!(first("2.5.3").as_deref(), Some("2.5"));
        assert_eq!(first("x=-4.5E-3;").as_deref(), Some("-4.5E-3"));
        assert_eq!(first("none here"), None);
    }

    #[test]
    fn grammar_errors() {
        assert_eq!(OutputGrammar::parse("{a} {b"), Err(GrammarError::UnclosedField(4)));
        assert_eq!(OutputGrammar::parse("x {}"), Err(GrammarError::EmptyField(2)));
    }

    #[test]
    fn has_field() {
        let grammar = OutputGrammar::parse("{gen} {nfe}").unwrap();
        assert!(grammar.has_field("nfe"));
        assert!(!grammar.has_field("lsnfe"));
    }
}
