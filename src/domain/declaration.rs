//! Unit declaration header parsing
//!
//! A unit source starts with a comment header:
//!
//! ```text
//! #!/usr/bin/env bash
//! # unit: fzf
//! # version: 1.4.0
//! # dependencies: logging, config
//! # class: optional
//! # provides: fuzzy-finder
//!
//! ...unit body...
//! ```
//!
//! Only the leading run of comment lines is read; the body is never
//! interpreted. Keys are case-insensitive, list values may be separated by
//! spaces, commas, or both.

use std::collections::HashSet;

use thiserror::Error;

use super::unit::{IdError, Metadata, UnitClass, UnitId};

/// Version recorded when a header does not declare one
pub const DEFAULT_VERSION: &str = "0.0.0";

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ParseError {
    #[error("Declaration header has no 'unit' field")]
    MissingId,

    #[error("Invalid unit ID in '{field}': {source}")]
    InvalidId {
        field: &'static str,
        #[source]
        source: IdError,
    },

    #[error("Unknown unit class '{0}' (expected core, standard, optional or experimental)")]
    InvalidClass(String),

    #[error("Header field '{0}' declared more than once")]
    DuplicateKey(String),

    #[error("Declared ID '{declared}' does not match unit '{expected}'")]
    IdMismatch { expected: UnitId, declared: UnitId },
}

/// Computes the content fingerprint of a unit source
pub fn fingerprint(source: &str) -> String {
    blake3::hash(source.as_bytes()).to_hex().to_string()
}

/// Extracts the declaration of a unit from its source without running it
pub fn extract(source: &str) -> Result<Metadata, ParseError> {
    let mut seen = HashSet::new();
    let mut id = None;
    let mut version = None;
    let mut dependencies = Vec::new();
    let mut class = None;
    let mut provides = Vec::new();

    for (key, value) in header_fields(source) {
        let canonical = match key.as_str() {
            "unit" | "id" => "unit",
            "version" => "version",
            "dependencies" | "depends" => "dependencies",
            "class" => "class",
            "provides" => "provides",
            _ => continue,
        };
        if !seen.insert(canonical) {
            return Err(ParseError::DuplicateKey(canonical.to_string()));
        }

        match canonical {
            "unit" => {
                if value.is_empty() {
                    return Err(ParseError::MissingId);
                }
                id = Some(parse_id("unit", value)?);
            }
            "version" => {
                if !value.is_empty() {
                    version = Some(value.to_string());
                }
            }
            "dependencies" => {
                for name in split_list(value) {
                    let dep = parse_id("dependencies", name)?;
                    if !dependencies.contains(&dep) {
                        dependencies.push(dep);
                    }
                }
            }
            "class" => {
                if !value.is_empty() {
                    class = Some(
                        value
                            .parse::<UnitClass>()
                            .map_err(ParseError::InvalidClass)?,
                    );
                }
            }
            "provides" => {
                for name in split_list(value) {
                    if !provides.iter().any(|p| p == name) {
                        provides.push(name.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    Ok(Metadata {
        id: id.ok_or(ParseError::MissingId)?,
        version: version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        dependencies,
        class: class.unwrap_or_default(),
        provides,
        fingerprint: fingerprint(source),
    })
}

fn parse_id(field: &'static str, value: &str) -> Result<UnitId, ParseError> {
    UnitId::new(value).map_err(|source| ParseError::InvalidId { field, source })
}

/// Splits a list value on commas and whitespace
fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
}

/// Yields `(lowercased key, trimmed value)` pairs from the leading comment block
fn header_fields(source: &str) -> impl Iterator<Item = (String, &str)> {
    source
        .lines()
        .enumerate()
        .filter(|(n, line)| !(*n == 0 && line.starts_with("#!")))
        .map(|(_, line)| line.trim())
        .skip_while(|line| line.is_empty())
        .take_while(|line| line.is_empty() || line.starts_with('#'))
        .filter_map(|line| {
            let body = line.trim_start_matches('#').trim();
            let (key, value) = body.split_once(':')?;
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return None;
            }
            Some((key.to_ascii_lowercase(), value.trim()))
        })
}
