// Copyright 2025 the compute_raster Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A small line-based preprocessor for the kernel sources.
//!
//! Supported directives, each on its own line:
//!
//! - `#ifdef NAME`, `#ifndef NAME`, `#else`, `#endif`
//! - `#import name`, which pastes `shader/shared/name.wgsl` (itself preprocessed)
//!
//! Directives after a `//` comment marker are ignored.

use std::collections::{HashMap, HashSet};

/// A malformed kernel source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{shader}.wgsl:{line}: {kind}")]
pub struct PreprocessError {
    pub shader: String,
    /// One-based line number.
    pub line: usize,
    pub kind: PreprocessErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PreprocessErrorKind {
    #[error("unknown import `{0}`")]
    UnknownImport(String),
    #[error("`#{0}` without a matching `#ifdef` or `#ifndef`")]
    Unmatched(&'static str),
    #[error("second `#else` for the same condition")]
    DuplicateElse,
    #[error("`#{0}` needs an argument")]
    MissingArgument(&'static str),
    #[error("unterminated conditional block")]
    Unterminated,
    #[error("import cycle through `{0}`")]
    ImportCycle(String),
}

struct Condition {
    active: bool,
    seen_else: bool,
}

/// Sources the preprocessor resolves `#import` against, keyed by file stem.
pub type Imports<'a> = HashMap<&'a str, &'a str>;

/// Expands the directives in `source`.
///
/// `defines` is the set of names for which `#ifdef` holds.
pub fn preprocess(
    source: &str,
    shader: &str,
    defines: &HashSet<&str>,
    imports: &Imports<'_>,
) -> Result<String, PreprocessError> {
    let mut output = String::with_capacity(source.len());
    let mut stack = Vec::new();
    expand(source, shader, defines, imports, &mut stack, &mut output)?;
    Ok(output)
}

fn expand<'a>(
    source: &str,
    shader: &str,
    defines: &HashSet<&str>,
    imports: &Imports<'a>,
    import_stack: &mut Vec<&'a str>,
    output: &mut String,
) -> Result<(), PreprocessError> {
    let mut conditions: Vec<Condition> = Vec::new();
    let error = |line: usize, kind| PreprocessError {
        shader: shader.to_owned(),
        line: line + 1,
        kind,
    };
    for (line_number, line) in source.lines().enumerate() {
        let active = conditions.iter().all(|c| c.active);
        let Some((directive, argument)) = parse_directive(line) else {
            if active {
                output.push_str(line);
                output.push('\n');
            }
            continue;
        };
        match directive {
            "ifdef" | "ifndef" => {
                if argument.is_empty() {
                    let name = if directive == "ifdef" { "ifdef" } else { "ifndef" };
                    return Err(error(line_number, PreprocessErrorKind::MissingArgument(name)));
                }
                let defined = defines.contains(argument);
                conditions.push(Condition {
                    active: defined == (directive == "ifdef"),
                    seen_else: false,
                });
            }
            "else" => {
                let condition = conditions
                    .last_mut()
                    .ok_or_else(|| error(line_number, PreprocessErrorKind::Unmatched("else")))?;
                if condition.seen_else {
                    return Err(error(line_number, PreprocessErrorKind::DuplicateElse));
                }
                condition.seen_else = true;
                condition.active = !condition.active;
            }
            "endif" => {
                if conditions.pop().is_none() {
                    return Err(error(line_number, PreprocessErrorKind::Unmatched("endif")));
                }
            }
            "import" => {
                if !active {
                    continue;
                }
                if argument.is_empty() {
                    return Err(error(line_number, PreprocessErrorKind::MissingArgument("import")));
                }
                let Some((name, contents)) = imports.get_key_value(argument) else {
                    return Err(error(
                        line_number,
                        PreprocessErrorKind::UnknownImport(argument.to_owned()),
                    ));
                };
                if import_stack.contains(name) {
                    return Err(error(
                        line_number,
                        PreprocessErrorKind::ImportCycle(argument.to_owned()),
                    ));
                }
                import_stack.push(*name);
                expand(contents, name, defines, imports, import_stack, output)?;
                import_stack.pop();
            }
            other => {
                log::warn!("{shader}.wgsl:{}: ignoring unknown directive `#{other}`", line_number + 1);
            }
        }
    }
    if !conditions.is_empty() {
        return Err(error(source.lines().count(), PreprocessErrorKind::Unterminated));
    }
    Ok(())
}

/// Splits `#name argument` into its parts. Returns `None` for ordinary lines.
fn parse_directive(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim_start().strip_prefix('#')?;
    let name_len = rest
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(rest.len());
    let (name, argument) = rest.split_at(name_len);
    let argument = match argument.find("//") {
        Some(comment) => &argument[..comment],
        None => argument,
    };
    Some((name, argument.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str, defines: &[&str]) -> Result<String, PreprocessError> {
        let imports: Imports<'_> = [("common", "const ONE = 1u;"), ("loop", "#import loop")]
            .into_iter()
            .collect();
        let defines = defines.iter().copied().collect();
        preprocess(source, "test", &defines, &imports)
    }

    #[test]
    fn conditionals() {
        let source = "a\n#ifdef X\nb\n#else\nc\n#endif\n#ifndef Y\nd\n#endif // trailing\n";
        assert_eq!(run(source, &[]).unwrap(), "a\nc\nd\n");
        assert_eq!(run(source, &["X", "Y"]).unwrap(), "a\nb\n");
    }

    #[test]
    fn nested_inactive_blocks_stay_inactive() {
        let source = "#ifdef X\n#ifdef Y\ny\n#else\nnot_y\n#endif\n#endif\n";
        assert_eq!(run(source, &["Y"]).unwrap(), "");
        assert_eq!(run(source, &["X"]).unwrap(), "not_y\n");
    }

    #[test]
    fn imports_are_expanded() {
        let source = "#import common\nfn f() {}\n#ifdef X\n#import missing\n#endif\n";
        assert_eq!(run(source, &[]).unwrap(), "const ONE = 1u;\nfn f() {}\n");
    }

    #[test]
    fn errors() {
        let unknown = run("#import missing", &[]).unwrap_err();
        assert_eq!(unknown.line, 1);
        assert_eq!(
            unknown.kind,
            PreprocessErrorKind::UnknownImport("missing".into())
        );
        assert_eq!(
            run("#endif", &[]).unwrap_err().kind,
            PreprocessErrorKind::Unmatched("endif")
        );
        assert_eq!(
            run("#ifdef X\n#else\n#else\n#endif", &[]).unwrap_err().kind,
            PreprocessErrorKind::DuplicateElse
        );
        assert_eq!(
            run("#ifdef X\n", &[]).unwrap_err().kind,
            PreprocessErrorKind::Unterminated
        );
        assert_eq!(
            run("#import loop", &[]).unwrap_err().kind,
            PreprocessErrorKind::ImportCycle("loop".into())
        );
    }

    #[test]
    fn commented_directives_are_plain_text() {
        assert_eq!(run("// #ifdef X\nx", &[]).unwrap(), "// #ifdef X\nx\n");
    }
}
