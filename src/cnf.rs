//! Reader for OpenSSL `.cnf` configuration files.
//!
//! Supports the subset of the format used by `openssl req` and `openssl ca`:
//! `[section]` headers, `key = value` assignments, `#` comments, quoting,
//! backslash escapes, line continuation and `$var` / `${section::var}`
//! expansion. Directives such as `.include` are rejected.

use crate::errors::{Error, Result};
use std::path::Path;

/// Name of the implicit section holding keys that precede the first header.
pub const DEFAULT_SECTION: &str = "default";

/// Pseudo-section that resolves variables from the process environment.
const ENV_SECTION: &str = "ENV";

/// One `[section]` of a configuration file, entries in file order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    /// Section name as written between the brackets.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of `key`, the last assignment winning.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All entries in the order they appear in the file.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn set(&mut self, key: String, value: String) {
        self.entries.push((key, value));
    }
}

/// A parsed configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Conf {
    sections: Vec<Section>,
}

impl Conf {
    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut conf = Conf {
            sections: vec![Section {
                name: DEFAULT_SECTION.to_owned(),
                entries: Vec::new(),
            }],
        };
        let mut current = 0;

        for (line_no, line) in logical_lines(text) {
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix('[') {
                let end = rest.find(']').ok_or_else(|| Error::ConfigParse {
                    line: line_no,
                    reason: "missing closing bracket".into(),
                })?;
                let name = rest[..end].trim();
                if name.is_empty() {
                    return Err(Error::ConfigParse {
                        line: line_no,
                        reason: "empty section name".into(),
                    });
                }
                let tail = rest[end + 1..].trim_start();
                if !(tail.is_empty() || tail.starts_with('#')) {
                    return Err(Error::ConfigParse {
                        line: line_no,
                        reason: format!("unexpected text after section header: `{tail}`"),
                    });
                }
                current = conf.section_index_or_insert(name);
                continue;
            }

            if trimmed.starts_with('.') {
                return Err(Error::ConfigParse {
                    line: line_no,
                    reason: format!("unsupported directive `{trimmed}`"),
                });
            }

            let eq = trimmed.find('=').ok_or_else(|| Error::ConfigParse {
                line: line_no,
                reason: "expected `key = value`".into(),
            })?;
            let key = trimmed[..eq].trim();
            if key.is_empty() || !key.chars().all(is_key_char) {
                return Err(Error::ConfigParse {
                    line: line_no,
                    reason: format!("invalid key `{key}`"),
                });
            }

            let value = conf.expand_value(&trimmed[eq + 1..], current, line_no)?;
            tracing::trace!(section = %conf.sections[current].name, key, value = %value, "cnf entry");
            conf.sections[current].set(key.to_owned(), value);
        }

        Ok(conf)
    }

    /// Read and parse the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        tracing::debug!(path = %path.display(), "loading configuration");
        Self::parse(&text)
    }

    /// Look up a section by name.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Like [`Conf::section`] but reports a missing section as an error
    /// against the key that referenced it.
    pub fn require_section(&self, name: &str, referenced_by: (&str, &str)) -> Result<&Section> {
        self.section(name).ok_or_else(|| Error::InvalidSetting {
            section: referenced_by.0.to_owned(),
            key: referenced_by.1.to_owned(),
            reason: format!("section [{name}] does not exist"),
        })
    }

    /// Value of `key` in `section`, falling back to the default section.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)
            .and_then(|s| s.get(key))
            .or_else(|| self.sections[0].get(key))
    }

    /// Like [`Conf::get`] but a missing key is an error.
    pub fn require(&self, section: &str, key: &str) -> Result<&str> {
        self.get(section, key).ok_or_else(|| Error::MissingSetting {
            section: section.to_owned(),
            key: key.to_owned(),
        })
    }

    /// Iterate over all sections, the implicit default section first.
    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    fn section_index_or_insert(&mut self, name: &str) -> usize {
        if let Some(idx) = self.sections.iter().position(|s| s.name == name) {
            return idx;
        }
        self.sections.push(Section {
            name: name.to_owned(),
            entries: Vec::new(),
        });
        self.sections.len() - 1
    }

    fn lookup_var(&self, section: Option<&str>, name: &str, current: usize) -> Option<String> {
        match section {
            Some(ENV_SECTION) => std::env::var(name).ok(),
            Some(section) => self.get(section, name).map(str::to_owned),
            None => self.sections[current]
                .get(name)
                .or_else(|| self.sections[0].get(name))
                .map(str::to_owned),
        }
    }

    fn expand_value(&self, raw: &str, current: usize, line: usize) -> Result<String> {
        let mut out = String::with_capacity(raw.len());
        // Length of `out` that must survive trailing-whitespace trimming.
        let mut protected = 0;
        let mut chars = raw.trim_start().chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '#' => break,
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(match escaped {
                            'n' => '\n',
                            'r' => '\r',
                            't' => '\t',
                            'b' => '\u{8}',
                            other => other,
                        });
                        protected = out.len();
                    }
                }
                '"' | '\'' => {
                    let mut closed = false;
                    for q in chars.by_ref() {
                        if q == c {
                            closed = true;
                            break;
                        }
                        out.push(q);
                    }
                    if !closed {
                        return Err(Error::ConfigParse {
                            line,
                            reason: "unterminated quote".into(),
                        });
                    }
                    protected = out.len();
                }
                '$' => {
                    let (section, name) = read_variable(&mut chars, line)?;
                    let value = self
                        .lookup_var(section.as_deref(), &name, current)
                        .ok_or_else(|| Error::ConfigParse {
                            line,
                            reason: match &section {
                                Some(s) => format!("variable `{s}::{name}` has no value"),
                                None => format!("variable `{name}` has no value"),
                            },
                        })?;
                    out.push_str(&value);
                    protected = out.len();
                }
                other => out.push(other),
            }
        }

        let keep = out.trim_end().len().max(protected);
        out.truncate(keep);
        Ok(out)
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ';' | ',' | '!' | '-')
}

fn is_var_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn read_name(chars: &mut core::iter::Peekable<core::str::Chars<'_>>) -> String {
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        if !is_var_char(c) {
            break;
        }
        name.push(c);
        chars.next();
    }
    name
}

/// Parse the variable reference following a `$`.
fn read_variable(
    chars: &mut core::iter::Peekable<core::str::Chars<'_>>,
    line: usize,
) -> Result<(Option<String>, String)> {
    let braced = chars.peek() == Some(&'{');
    if braced {
        chars.next();
    }

    let first = read_name(chars);
    let mut second = None;
    if chars.peek() == Some(&':') {
        chars.next();
        if chars.next() != Some(':') {
            return Err(Error::ConfigParse {
                line,
                reason: "expected `::` in variable reference".into(),
            });
        }
        second = Some(read_name(chars));
    }

    if braced && chars.next() != Some('}') {
        return Err(Error::ConfigParse {
            line,
            reason: "unterminated `${`".into(),
        });
    }

    let (section, name) = match second {
        Some(name) => (Some(first), name),
        None => (None, first),
    };
    if name.is_empty() || section.as_deref() == Some("") {
        return Err(Error::ConfigParse {
            line,
            reason: "empty variable name".into(),
        });
    }
    Ok((section, name))
}

/// Split text into logical lines, joining `\`-continued lines. Yields the
/// 1-based number of the first physical line of each logical line.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, physical) in text.lines().enumerate() {
        let (start, mut buf) = pending.take().unwrap_or((idx + 1, String::new()));
        let trailing = physical.len() - physical.trim_end_matches('\\').len();
        if trailing % 2 == 1 {
            buf.push_str(&physical[..physical.len() - 1]);
            pending = Some((start, buf));
        } else {
            buf.push_str(physical);
            lines.push((start, buf));
        }
    }
    if let Some(last) = pending {
        lines.push(last);
    }
    lines
}
