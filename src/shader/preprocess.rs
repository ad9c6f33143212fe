//! Line-based define preprocessor applied before WGSL parsing.
//!
//! The stage name (`VERTEX`, `FRAGMENT`, `COMPUTE`) is always defined, and
//! `DEBUG` is defined for debug descriptors.
//!
//! Supports `#ifdef NAME`, `#ifndef NAME`, `#else` and `#endif`, plus
//! whole-word substitution of defines that carry a value. Directive lines and
//! disabled lines are blanked rather than removed so parser diagnostics keep
//! their line numbers.

use std::collections::HashMap;

use super::ShaderDescriptor;

#[derive(Debug, Clone, Copy)]
struct Block {
    parent_active: bool,
    condition: bool,
    in_else: bool,
}

impl Block {
    fn active(&self) -> bool {
        self.parent_active && (self.condition != self.in_else)
    }
}

/// Apply the descriptor's defines (and the stage define) to its source.
pub(crate) fn preprocess(descriptor: &ShaderDescriptor) -> Result<String, String> {
    let mut defines: HashMap<&str, &str> = descriptor.defines().collect();
    defines
        .entry(descriptor.stage().define_name())
        .or_insert("");
    if descriptor.debug() {
        defines.entry("DEBUG").or_insert("");
    }
    run(descriptor.source(), &defines)
}

fn run(source: &str, defines: &HashMap<&str, &str>) -> Result<String, String> {
    let substitutions: HashMap<&str, &str> = defines
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(&name, &value)| (name, value))
        .collect();

    let mut output = String::with_capacity(source.len());
    let mut stack: Vec<Block> = Vec::new();

    for (index, line) in source.lines().enumerate() {
        let line_number = index + 1;
        let active = stack.last().map_or(true, Block::active);
        let trimmed = line.trim();

        if let Some(name) = directive(trimmed, "#ifdef") {
            stack.push(Block {
                parent_active: active,
                condition: defines.contains_key(name),
                in_else: false,
            });
        } else if let Some(name) = directive(trimmed, "#ifndef") {
            stack.push(Block {
                parent_active: active,
                condition: !defines.contains_key(name),
                in_else: false,
            });
        } else if trimmed == "#else" {
            let block = stack
                .last_mut()
                .ok_or_else(|| format!("line {line_number}: #else without #ifdef"))?;
            if block.in_else {
                return Err(format!("line {line_number}: duplicate #else"));
            }
            block.in_else = true;
        } else if trimmed == "#endif" {
            stack
                .pop()
                .ok_or_else(|| format!("line {line_number}: #endif without #ifdef"))?;
        } else if active {
            if substitutions.is_empty() {
                output.push_str(line);
            } else {
                substitute(line, &substitutions, &mut output);
            }
        }
        output.push('\n');
    }

    if !stack.is_empty() {
        return Err(format!("{} unterminated #ifdef block(s)", stack.len()));
    }
    Ok(output)
}

fn directive<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(keyword)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    rest.split_whitespace().next()
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn substitute(line: &str, substitutions: &HashMap<&str, &str>, output: &mut String) {
    let mut chars = line.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if !is_ident_start(c) {
            output.push(c);
            // Skip the tail of numeric literals like `1e3` or `0x1f`.
            if c.is_ascii_digit() {
                while let Some(&(_, next)) = chars.peek() {
                    if !is_ident_continue(next) {
                        break;
                    }
                    output.push(next);
                    chars.next();
                }
            }
            continue;
        }
        let mut end = start + c.len_utf8();
        while let Some(&(index, next)) = chars.peek() {
            if !is_ident_continue(next) {
                break;
            }
            end = index + next.len_utf8();
            chars.next();
        }
        let word = &line[start..end];
        output.push_str(substitutions.get(word).copied().unwrap_or(word));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::ShaderStage;

    fn defines<'a>(pairs: &[(&'a str, &'a str)]) -> HashMap<&'a str, &'a str> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_ifdef_else() {
        let source = "a\n#ifdef FOO\nb\n#else\nc\n#endif\nd";
        let out = run(source, &defines(&[("FOO", "")])).unwrap();
        assert_eq!(out, "a\n\nb\n\n\n\nd\n");

        let out = run(source, &defines(&[])).unwrap();
        assert_eq!(out, "a\n\n\n\nc\n\nd\n");
    }

    #[test]
    fn test_nested_blocks() {
        let source = "#ifndef A\n#ifdef B\nx\n#endif\ny\n#endif";
        let out = run(source, &defines(&[("B", "")])).unwrap();
        assert_eq!(out.lines().filter(|l| !l.is_empty()).collect::<Vec<_>>(), ["x", "y"]);

        let out = run(source, &defines(&[("A", ""), ("B", "")])).unwrap();
        assert!(out.trim().is_empty());
    }

    #[test]
    fn test_value_substitution_is_whole_word() {
        let out = run(
            "let s = SCALE * SCALE_X + 1e3;",
            &defines(&[("SCALE", "2.0"), ("e3", "bad")]),
        )
        .unwrap();
        assert_eq!(out, "let s = 2.0 * SCALE_X + 1e3;\n");
    }

    #[test]
    fn test_unbalanced_directives() {
        assert!(run("#endif", &defines(&[])).is_err());
        assert!(run("#ifdef A\nx", &defines(&[])).is_err());
        assert!(run("#else", &defines(&[])).is_err());
    }

    #[test]
    fn test_stage_define_is_set() {
        let descriptor = ShaderDescriptor::new(
            ShaderStage::Compute,
            "#ifdef COMPUTE\ncompute\n#endif\n#ifdef VERTEX\nvertex\n#endif",
            "main",
        );
        let out = preprocess(&descriptor).unwrap();
        assert!(out.contains("compute"));
        assert!(!out.contains("vertex"));
    }
}
