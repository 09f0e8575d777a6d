//! # Glob Pattern Compiler
//!
//! Translates user-facing path globs into anchored regular expressions that the
//! Seatbelt `(regex #"…")` filter accepts, and compiles the same expression
//! with the `regex` crate so matching can be tested in-process.
//!
//! | Glob      | Regex     | Meaning                                            |
//! |-----------|-----------|----------------------------------------------------|
//! | `*`       | `[^/]*`   | any run of characters within one path segment      |
//! | `**`      | `.*`      | any run including `/`; swallows a following `/`     |
//! | `?`       | `[^/]`    | one non-separator character                        |
//! | `[…]`     | `[…]`     | character class, copied verbatim (`[!…]` → `[^…]`) |
//! | `{a,b}`   | `(a\|b)`  | alternation, nested groups allowed                 |
//!
//! Inputs without glob syntax are treated as literal paths: they are normalised
//! (tilde, absolute, symlinks) and matched exactly.
//!
//! The translator is an index-based scanner over the pattern's characters. Brace
//! groups recurse on index ranges rather than on sliced strings, so error
//! positions always refer to the full pattern.

use regex::Regex;
use thiserror::Error;

use super::paths::{contains_glob, expand_tilde, normalise_path};

/// Errors raised while compiling a glob. Compilation never partially succeeds.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("unclosed character class at position {position} in pattern '{pattern}'")]
    UnclosedBracket { pattern: String, position: usize },

    #[error("unclosed brace group at position {position} in pattern '{pattern}'")]
    UnclosedBrace { pattern: String, position: usize },

    #[error("pattern '{pattern}' produced an invalid expression: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("cannot normalise path '{path}': {source}")]
    Normalisation {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A compiled path pattern. Immutable once built.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    source: String,
    regex_source: String,
    matcher: Regex,
    literal: bool,
}

impl CompiledPattern {
    /// The pattern as written by the user.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The anchored expression, suitable for a Seatbelt `regex` filter.
    pub fn regex_source(&self) -> &str {
        &self.regex_source
    }

    /// `true` when the input had no glob syntax.
    pub fn is_literal(&self) -> bool {
        self.literal
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.matcher.is_match(path)
    }
}

/// Compile a glob (or literal path) into a matcher.
pub fn compile(pattern: &str) -> Result<CompiledPattern, PatternError> {
    let regex_source = glob_to_regex(pattern)?;
    let matcher = Regex::new(&regex_source).map_err(|source| PatternError::Regex {
        pattern: pattern.to_string(),
        source,
    })?;

    Ok(CompiledPattern {
        source: pattern.to_string(),
        regex_source,
        matcher,
        literal: !contains_glob(pattern),
    })
}

/// Convert a glob into an expression anchored at both ends.
pub fn glob_to_regex(pattern: &str) -> Result<String, PatternError> {
    let normalisation_error = |source| PatternError::Normalisation {
        path: pattern.to_string(),
        source,
    };

    if !contains_glob(pattern) {
        let literal = normalise_path(pattern).map_err(normalisation_error)?;
        let mut out = String::with_capacity(literal.len() * 2 + 2);
        out.push('^');
        literal.chars().for_each(|c| push_escaped(&mut out, c));
        out.push('$');
        return Ok(out);
    }

    let subject = expand_tilde(pattern).map_err(normalisation_error)?;
    let translator = Translator::new(&subject);
    let mut out = String::with_capacity(subject.len() * 2 + 2);
    out.push('^');
    translator.translate(0, translator.chars.len(), &mut out)?;
    out.push('$');
    Ok(out)
}

struct Translator<'a> {
    pattern: &'a str,
    chars: Vec<char>,
}

impl<'a> Translator<'a> {
    fn new(pattern: &'a str) -> Self {
        Self {
            pattern,
            chars: pattern.chars().collect(),
        }
    }

    /// Translate `chars[start..end]` into `out`.
    fn translate(&self, start: usize, end: usize, out: &mut String) -> Result<(), PatternError> {
        let mut i = start;
        while i < end {
            match self.chars[i] {
                '*' => {
                    if i + 1 < end && self.chars[i + 1] == '*' {
                        i += 2;
                        if i < end && self.chars[i] == '/' {
                            i += 1;
                        }
                        out.push_str(".*");
                    } else {
                        out.push_str("[^/]*");
                        i += 1;
                    }
                }
                '?' => {
                    out.push_str("[^/]");
                    i += 1;
                }
                '[' => {
                    let close = self.class_end(i, end)?;
                    out.push('[');
                    let mut j = i + 1;
                    if j < close && self.chars[j] == '!' {
                        out.push('^');
                        j += 1;
                    }
                    out.extend(&self.chars[j..=close]);
                    i = close + 1;
                }
                '{' => {
                    let close = self.brace_end(i, end)?;
                    out.push('(');
                    for (n, (alt_start, alt_end)) in
                        self.alternatives(i + 1, close).into_iter().enumerate()
                    {
                        if n > 0 {
                            out.push('|');
                        }
                        self.translate(alt_start, alt_end, out)?;
                    }
                    out.push(')');
                    i = close + 1;
                }
                c => {
                    push_escaped(out, c);
                    i += 1;
                }
            }
        }
        Ok(())
    }

    /// Index of the `]` closing the class opened at `open`.
    fn class_end(&self, open: usize, end: usize) -> Result<usize, PatternError> {
        (open + 1..end)
            .find(|&j| self.chars[j] == ']')
            .ok_or_else(|| PatternError::UnclosedBracket {
                pattern: self.pattern.to_string(),
                position: open,
            })
    }

    /// Index of the `}` closing the group opened at `open`, honouring nesting.
    fn brace_end(&self, open: usize, end: usize) -> Result<usize, PatternError> {
        let mut depth = 0usize;
        let mut j = open;
        while j < end {
            match self.chars[j] {
                '[' => j = self.class_end(j, end)?,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(j);
                    }
                }
                _ => {}
            }
            j += 1;
        }
        Err(PatternError::UnclosedBrace {
            pattern: self.pattern.to_string(),
            position: open,
        })
    }

    /// Split `chars[start..end]` on commas at the top nesting level.
    fn alternatives(&self, start: usize, end: usize) -> Vec<(usize, usize)> {
        let mut parts = Vec::new();
        let mut depth = 0usize;
        let mut part_start = start;
        let mut j = start;
        while j < end {
            match self.chars[j] {
                // brace_end already proved every class in range is closed
                '[' => {
                    if let Some(close) = (j + 1..end).find(|&k| self.chars[k] == ']') {
                        j = close;
                    }
                }
                '{' => depth += 1,
                '}' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    parts.push((part_start, j));
                    part_start = j + 1;
                }
                _ => {}
            }
            j += 1;
        }
        parts.push((part_start, end));
        parts
    }
}

fn push_escaped(out: &mut String, c: char) {
    if matches!(
        c,
        '.' | '+' | '^' | '$' | '(' | ')' | '|' | '\\' | '[' | ']' | '{' | '}' | '*' | '?'
    ) {
        out.push('\\');
    }
    out.push(c);
}
