//! Env-file manipulation shared by the `env set` dispatcher verb and the
//! File Installer's `EnvFile` artifact handling. Testable property #6:
//! `apply(content, assigns)` applied twice equals applied once, and keys
//! not mentioned are preserved verbatim (including order and `export`
//! prefix).

use once_cell::sync::Lazy;
use regex::Regex;

static KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// A single `KEY=VALUE` (or `KEY=` to remove `KEY`) assignment.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Environment variable name; must match `[A-Za-z_][A-Za-z0-9_]*`.
    pub key: String,
    /// New value. An empty value removes the key entirely.
    pub value: String,
}

impl Assignment {
    /// Parse a single `KEY=VALUE` token from the `env set` verb's
    /// arguments.
    pub fn parse(token: &str) -> crate::errors::Result<Self> {
        let (key, value) = token.split_once('=').ok_or_else(|| {
            crate::errors::Error::InvalidInput(format!("not a KEY=VALUE assignment: '{token}'"))
        })?;
        if !KEY_RE.is_match(key) {
            return Err(crate::errors::Error::InvalidInput(format!(
                "invalid environment key: '{key}'"
            )));
        }
        Ok(Assignment {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

struct ParsedLine {
    export_prefix: bool,
    key: String,
    value: String,
    raw: String,
}

fn parse_line(line: &str) -> Option<ParsedLine> {
    let (export_prefix, rest) = match line.strip_prefix("export ") {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    let (key, value) = rest.split_once('=')?;
    Some(ParsedLine {
        export_prefix,
        key: key.to_string(),
        value: value.to_string(),
        raw: line.to_string(),
    })
}

/// Apply `assigns` to `content`: edit matching keys in place (preserving
/// an optional `export ` prefix and the line's position), remove keys
/// whose assigned value is empty, and append any assigned keys not
/// already present. Keys not mentioned in `assigns` are preserved
/// verbatim, including their original line text and order.
pub fn apply(content: &str, assigns: &[Assignment]) -> String {
    let mut lines: Vec<Option<ParsedLine>> = Vec::new();
    let mut raw_lines: Vec<String> = Vec::new();
    for line in content.lines() {
        raw_lines.push(line.to_string());
        lines.push(parse_line(line));
    }

    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut out_lines: Vec<String> = Vec::with_capacity(raw_lines.len());

    for (raw, parsed) in raw_lines.iter().zip(lines.iter()) {
        match parsed {
            Some(p) => {
                if let Some(assign) = assigns.iter().find(|a| a.key == p.key) {
                    seen.insert(assign.key.clone());
                    if assign.value.is_empty() {
                        // Removal: drop the line entirely.
                        continue;
                    }
                    let prefix = if p.export_prefix { "export " } else { "" };
                    out_lines.push(format!("{prefix}{}={}", p.key, assign.value));
                } else {
                    out_lines.push(p.raw.clone());
                }
            }
            None => out_lines.push(raw.clone()),
        }
    }

    for assign in assigns {
        if !seen.contains(&assign.key) && !assign.value.is_empty() {
            out_lines.push(format!("{}={}", assign.key, assign.value));
        }
    }

    let mut result = out_lines.join("\n");
    if !result.is_empty() {
        result.push('\n');
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign(key: &str, value: &str) -> Assignment {
        Assignment {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn set_preserves_export_and_removes_empty() {
        let input = "export FOO=one\nBAR=two\n";
        let assigns = vec![assign("FOO", "three"), assign("BAR", "")];
        assert_eq!(apply(input, &assigns), "export FOO=three\n");
    }

    #[test]
    fn apply_is_idempotent() {
        let input = "export FOO=one\nBAR=two\nBAZ=three\n";
        let assigns = vec![assign("FOO", "changed")];
        let once = apply(input, &assigns);
        let twice = apply(&once, &assigns);
        assert_eq!(once, twice);
    }

    #[test]
    fn unmentioned_keys_preserved_verbatim_including_order() {
        let input = "A=1\nexport B=2\nC=3\n";
        let assigns = vec![assign("B", "22")];
        let out = apply(input, &assigns);
        assert_eq!(out, "A=1\nexport B=22\nC=3\n");
    }

    #[test]
    fn appends_new_keys() {
        let input = "A=1\n";
        let assigns = vec![assign("NEW", "val")];
        assert_eq!(apply(input, &assigns), "A=1\nNEW=val\n");
    }

    #[test]
    fn parse_rejects_invalid_keys() {
        assert!(Assignment::parse("1BAD=x").is_err());
        assert!(Assignment::parse("no-equals").is_err());
        assert!(Assignment::parse("OK=value").is_ok());
    }
}
