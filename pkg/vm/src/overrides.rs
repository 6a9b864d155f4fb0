//! Process-global QEMU argv overrides.
//!
//! Operators can patch the assembled command line with ordered
//! {match, replacement} string edits. The argv is joined into one
//! shell-escaped string, every edit is applied in insertion order, and the
//! result is re-tokenized honoring double-quote grouping.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::VmError;

/// Wildcard accepted by [`QemuOverrides::delete`] to clear the table.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone)]
pub struct QemuOverride {
    pub find: String,
    pub repl: String,
}

#[derive(Debug, Default)]
pub struct QemuOverrides {
    // BTreeMap keyed by a monotonic id keeps insertion order.
    map: Mutex<BTreeMap<usize, QemuOverride>>,
    next_id: AtomicUsize,
}

impl QemuOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an edit; returns its id.
    pub fn add(&self, find: &str, repl: &str) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut map = self.map.lock().unwrap();
        map.insert(
            id,
            QemuOverride {
                find: find.to_string(),
                repl: repl.to_string(),
            },
        );
        id
    }

    /// Delete one edit by id, or every edit with the wildcard.
    pub fn delete(&self, spec: &str) -> Result<(), VmError> {
        let mut map = self.map.lock().unwrap();
        if spec == WILDCARD {
            map.clear();
            return Ok(());
        }

        let id: usize = spec
            .parse()
            .map_err(|_| VmError::InvalidId(spec.to_string()))?;
        map.remove(&id);
        Ok(())
    }

    /// Run an argv through every registered edit.
    pub fn apply(&self, args: &[String]) -> Vec<String> {
        let map = self.map.lock().unwrap();
        let mut joined = escape_args(args);
        for ov in map.values() {
            joined = joined.replace(&ov.find, &ov.repl);
        }
        tokenize_quoted(&joined)
    }

    /// Tabular dump plus a before/after rendering of the given argv.
    pub fn preview(&self, args: &[String]) -> String {
        let mut out = format!("{:<4} {:<24} {}\n", "id", "match", "replacement");
        {
            let map = self.map.lock().unwrap();
            for (id, ov) in map.iter() {
                out.push_str(&format!(
                    "{:<4} {:<24} {:?}\n",
                    id,
                    format!("{:?}", ov.find),
                    ov.repl
                ));
            }
        }

        out.push_str(&format!("\nBefore overrides:\n{}\n", escape_args(args)));
        out.push_str(&format!(
            "\nAfter overrides:\n{}\n",
            escape_args(&self.apply(args))
        ));
        out
    }
}

/// Join an argv into one string, double-quoting arguments that contain
/// whitespace.
pub fn escape_args(args: &[String]) -> String {
    args.iter()
        .map(|a| {
            if a.chars().any(char::is_whitespace) {
                format!("\"{}\"", a)
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a string on whitespace, keeping double-quoted runs together
/// (quotes stripped).
pub fn tokenize_quoted(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in s.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_table_is_identity() {
        let ov = QemuOverrides::new();
        let args = argv(&["-enable-kvm", "-append", "console=ttyS0 root=/dev/sda", "-m", "2048"]);
        assert_eq!(ov.apply(&args), args);
    }

    #[test]
    fn test_overrides_apply_in_insertion_order() {
        let ov = QemuOverrides::new();
        ov.add("cirrus", "std");
        ov.add("-vga std", "-vga qxl");
        let args = argv(&["-vga", "cirrus"]);
        assert_eq!(ov.apply(&args), argv(&["-vga", "qxl"]));
    }

    #[test]
    fn test_delete_by_id_and_wildcard() {
        let ov = QemuOverrides::new();
        let id = ov.add("a", "b");
        ov.add("c", "d");

        ov.delete(&id.to_string()).unwrap();
        assert_eq!(ov.apply(&argv(&["a", "c"])), argv(&["a", "d"]));

        ov.delete(WILDCARD).unwrap();
        assert_eq!(ov.apply(&argv(&["a", "c"])), argv(&["a", "c"]));

        assert!(ov.delete("not-a-number").is_err());
    }

    #[test]
    fn test_replacement_can_split_tokens() {
        let ov = QemuOverrides::new();
        ov.add("-nographic", "-display sdl");
        let args = argv(&["-nographic", "-m", "512"]);
        assert_eq!(ov.apply(&args), argv(&["-display", "sdl", "-m", "512"]));
    }

    #[test]
    fn test_tokenize_respects_quotes() {
        assert_eq!(
            tokenize_quoted("-append \"a b c\" -m 512"),
            argv(&["-append", "a b c", "-m", "512"])
        );
    }

    #[test]
    fn test_preview_mentions_edits() {
        let ov = QemuOverrides::new();
        ov.add("cirrus", "std");
        let text = ov.preview(&argv(&["-vga", "cirrus"]));
        assert!(text.contains("Before overrides:"));
        assert!(text.contains("After overrides:"));
        assert!(text.contains("cirrus"));
    }
}
