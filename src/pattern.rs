//! Compiled token patterns for command templates and output grammars.

use std::sync::LazyLock;

use regex::Regex;

fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(_compile_err) => match Regex::new(r"$^") {
            Ok(fallback) => fallback,
            Err(fallback_err) => panic!("hardcoded fallback regex must compile: {fallback_err}"),
        },
    }
}

/// Argv template token: `(1)` identifier, `(2)` `[identifier]`, `(3)` flag
/// such as `-x` or `--name=`, or any other single character.
pub(crate) static ARGV_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"(?s)(\w+)|\[(\w+)\]|(-+\w+=?|.)"));

/// Output grammar token: `(1)` contents of `{...}`, `(2)` bare identifier,
/// `(3)` single separator character.
pub(crate) static GRAMMAR_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"(?s)\{([^}]*)\}|(\w+)|(.)"));

/// Integer, decimal or scientific-notation number.
pub(crate) static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"[-+]?([0-9]*[.])?[0-9]+([eE][-+]?[0-9]+)?"));
