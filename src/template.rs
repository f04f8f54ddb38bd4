//! Command-line templating for sweep jobs.
//!
//! An argv template such as `ell pop fn [verbose] --seed= seed` is split into
//! identifiers (required), `[identifier]` (optional), flags (`-x`, `--name=`)
//! and single-character literals. Each identifier other than the reserved
//! `pop` and `seed` is resolved, highest priority first, from:
//!
//! 1. keyword overrides passed by the caller
//! 2. the job's value mappings (`basics[from]` looked up in `map`)
//! 3. the `basics` section
//! 4. the job's `fixed_fields`
//!
//! Unresolved required identifiers are left as they are; unresolved optional
//! ones are dropped. The reserved tokens are filled in last by
//! [`finalize_argv`], before [`build_spec`] prefixes `./<bin>`.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::{JobTemplate, SweepConfig};
use crate::error::TemplateError;
use crate::pattern::ARGV_TOKEN;
use crate::scheduler::{JobSpec, Priority};

const RESERVED: [&str; 2] = ["pop", "seed"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Required(&'a str),
    Optional(&'a str),
    Literal(&'a str),
}

fn tokenize(argv: &str) -> Vec<Token<'_>> {
    ARGV_TOKEN
        .captures_iter(argv)
        .filter_map(|caps| {
            if let Some(name) = caps.get(1) {
                Some(Token::Required(name.as_str()))
            } else if let Some(name) = caps.get(2) {
                Some(Token::Optional(name.as_str()))
            } else {
                caps.get(3).map(|text| Token::Literal(text.as_str()))
            }
        })
        .collect()
}

/// Render a scalar config value as an argv string.
fn render_value(token: &str, value: &Value) -> Result<String, TemplateError> {
    match value {
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        _ => Err(TemplateError::UnsupportedValue {
            token: token.to_string(),
        }),
    }
}

fn template<'a>(config: &'a SweepConfig, job: &str) -> Result<&'a JobTemplate, TemplateError> {
    config
        .jobs
        .get(job)
        .ok_or_else(|| TemplateError::UnknownJob(job.to_string()))
}

fn resolve(
    config: &SweepConfig,
    job: &str,
    spec: &JobTemplate,
    token: &str,
    kwargs: &BTreeMap<String, String>,
) -> Result<Option<String>, TemplateError> {
    if let Some(value) = kwargs.get(token) {
        tracing::info!(job, token, value = %value, "argv substitution (kwargs)");
        return Ok(Some(value.clone()));
    }

    if let Some(mapping) = spec.io.mappings.iter().find(|m| m.to == token) {
        let source = config.basics.get(&mapping.from).ok_or_else(|| {
            TemplateError::MissingMappingSource {
                token: token.to_string(),
                from: mapping.from.clone(),
            }
        })?;
        let key = render_value(&mapping.from, source)?;
        let mapped = mapping
            .map
            .get(&key)
            .ok_or_else(|| TemplateError::UnmappedValue {
                token: token.to_string(),
                value: key.clone(),
            })?;
        let value = render_value(token, mapped)?;
        tracing::info!(job, token, source = %key, value = %value, "argv substitution (mappings)");
        return Ok(Some(value));
    }

    if let Some(value) = config.basics.get(token) {
        let value = render_value(token, value)?;
        tracing::info!(job, token, value = %value, "argv substitution (basics)");
        return Ok(Some(value));
    }

    if let Some(value) = spec.io.fixed_fields.get(token) {
        let value = render_value(token, value)?;
        tracing::info!(job, token, value = %value, "argv substitution (fixed fields)");
        return Ok(Some(value));
    }

    tracing::debug!(job, token, "No substitution found");
    Ok(None)
}

/// Render the argv of `job` with every resolvable token filled in. The
/// reserved tokens are left for [`finalize_argv`].
pub fn render_argv(
    config: &SweepConfig,
    job: &str,
    kwargs: &BTreeMap<String, String>,
) -> Result<String, TemplateError> {
    let spec = template(config, job)?;
    let mut argv = String::new();

    for token in tokenize(&spec.io.argv) {
        match token {
            Token::Literal(text) => argv.push_str(text),
            Token::Required(name) if RESERVED.contains(&name) => argv.push_str(name),
            Token::Required(name) => match resolve(config, job, spec, name, kwargs)? {
                Some(value) => argv.push_str(&value),
                None => argv.push_str(name),
            },
            Token::Optional(name) => match resolve(config, job, spec, name, kwargs)? {
                Some(value) => argv.push_str(&value),
                None => {
                    tracing::warn!(job, token = name, "Optional argument not set, dropping it");
                }
            },
        }
    }

    Ok(argv)
}

/// Environment for `job`: values naming a keyword override take its value.
pub fn render_env(
    config: &SweepConfig,
    job: &str,
    kwargs: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, TemplateError> {
    let spec = template(config, job)?;
    Ok(spec
        .io
        .envs
        .iter()
        .map(|(key, value)| {
            let value = kwargs.get(value).unwrap_or(value);
            (key.clone(), value.clone())
        })
        .collect())
}

/// Fill in the reserved `pop` and `seed` tokens of a rendered argv. `pop`
/// must be present.
pub fn finalize_argv(argv: &str, pop: u64, seed: u32) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(argv.len() + 8);
    let mut has_pop = false;

    for token in tokenize(argv) {
        match token {
            Token::Required("pop") => {
                has_pop = true;
                out.push_str(&pop.to_string());
            }
            Token::Required("seed") => out.push_str(&seed.to_string()),
            Token::Required(text) | Token::Literal(text) => out.push_str(text),
            Token::Optional(name) => {
                out.push('[');
                out.push_str(name);
                out.push(']');
            }
        }
    }

    if !has_pop {
        tracing::error!(argv, "Cannot substitute pop");
        return Err(TemplateError::MissingPopulation(argv.to_string()));
    }
    Ok(out)
}

/// Everything a sweep needs to queue one run of `job`.
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub job: &'a str,
    pub kwargs: &'a BTreeMap<String, String>,
    pub pop: u64,
    pub seed: u32,
    pub priority: Priority,
}

/// Assemble `./<bin> <argv>` with its cwd, env and priority.
pub fn build_spec(config: &SweepConfig, run: &RunRequest<'_>) -> Result<JobSpec, TemplateError> {
    let job = template(config, run.job)?;
    let argv = render_argv(config, run.job, run.kwargs)?;
    let argv = finalize_argv(&argv, run.pop, run.seed)?;
    let env = render_env(config, run.job, run.kwargs)?;

    let mut spec = JobSpec::new(format!("./{} {}", job.bin, argv))
        .with_envs(env)
        .with_priority(run.priority);
    if let Some(cwd) = &job.cwd {
        spec = spec.with_cwd(cwd.clone());
    }
    Ok(spec)
}
