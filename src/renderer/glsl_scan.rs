//! Lightweight GLSL scanning.
//!
//! This is not a parser. It tokenizes comment-stripped source, tracks brace and
//! paren nesting, and answers the handful of questions the source transform
//! and the headless compiler need: which globals are declared, which
//! identifiers are referenced, which functions are defined and where the
//! preprocessor directives sit. Byte offsets always point into the original
//! source text.

/// Storage qualifiers that introduce a global interface declaration.
const STORAGE_QUALIFIERS: [&str; 3] = ["uniform", "in", "out"];

/// Qualifiers that may precede the type in a declaration and are skipped.
const PASSTHROUGH_QUALIFIERS: [&str; 9] = [
    "lowp", "mediump", "highp", "flat", "smooth", "centroid", "invariant", "const", "layout",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub text: String,
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    /// 1-based line number.
    pub line: usize,
    /// Brace nesting outside this token (a `{` reports the depth it opens from).
    pub depth: usize,
    /// Paren nesting outside this token.
    pub parens: usize,
}

impl Token {
    fn is_ident(&self) -> bool {
        self.text
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    }
}

/// A preprocessor line such as `#version 300 es`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Directive {
    pub name: String,
    pub text: String,
    pub line: usize,
    pub start: usize,
    /// Offset just past the terminating newline (or end of input).
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Declaration {
    pub qualifier: String,
    pub ty: String,
    pub names: Vec<String>,
    pub line: usize,
}

/// A file-scope statement terminated by `;`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Statement {
    tokens: Vec<usize>,
    /// Offset just past the `;`.
    end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Imbalance {
    pub delimiter: char,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct GlslScan {
    tokens: Vec<Token>,
    directives: Vec<Directive>,
    statements: Vec<Statement>,
    declarations: Vec<Declaration>,
    imbalance: Option<Imbalance>,
}

/// Blank out `//` and `/* */` comments byte-for-byte, keeping newlines so that
/// offsets and line numbers survive.
pub(crate) fn strip_comments(source: &str) -> String {
    let bytes = source.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                out.push(b' ');
                i += 1;
            }
        } else if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            out.extend_from_slice(b"  ");
            i += 2;
            while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                out.push(if bytes[i] == b'\n' { b'\n' } else { b' ' });
                i += 1;
            }
            if i < bytes.len() {
                out.extend_from_slice(b"  ");
                i += 2;
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    // Comment bytes were replaced wholesale, so no multi-byte sequence is split.
    String::from_utf8_lossy(&out).into_owned()
}

impl GlslScan {
    pub fn new(source: &str) -> Self {
        let stripped = strip_comments(source);
        let (tokens, directives, imbalance) = tokenize(&stripped);
        let statements = file_scope_statements(&tokens);
        let declarations = collect_declarations(&tokens);
        Self {
            tokens,
            directives,
            statements,
            declarations,
            imbalance,
        }
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn directive(&self, name: &str) -> Option<&Directive> {
        self.directives.iter().find(|d| d.name == name)
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    pub fn imbalance(&self) -> Option<&Imbalance> {
        self.imbalance.as_ref()
    }

    pub fn declares(&self, qualifier: &str, name: &str) -> bool {
        self.declarations
            .iter()
            .any(|d| d.qualifier == qualifier && d.names.iter().any(|n| n == name))
    }

    /// First file-scope declaration with the given qualifier and type.
    pub fn find_declaration(&self, qualifier: &str, ty: &str) -> Option<&Declaration> {
        self.declarations
            .iter()
            .find(|d| d.qualifier == qualifier && d.ty == ty)
    }

    pub fn references(&self, ident: &str) -> bool {
        self.tokens.iter().any(|t| t.text == ident)
    }

    /// True when `name(...) { ... }` is defined at file scope.
    pub fn defines_function(&self, name: &str) -> bool {
        self.tokens.iter().enumerate().any(|(i, t)| {
            if t.text != name || t.depth != 0 || t.parens != 0 {
                return false;
            }
            let has_return_type = i > 0 && self.tokens[i - 1].is_ident();
            let opens_params = self.tokens.get(i + 1).is_some_and(|n| n.text == "(");
            if !has_return_type || !opens_params {
                return false;
            }
            let Some(close) = self.matching_paren(i + 1) else {
                return false;
            };
            self.tokens.get(close + 1).is_some_and(|n| n.text == "{")
        })
    }

    /// Offset just past the `;` of a `precision <q> float;` statement.
    pub fn float_precision_end(&self) -> Option<usize> {
        self.statements.iter().find_map(|s| {
            let words: Vec<&str> = s.tokens.iter().map(|&i| self.tokens[i].text.as_str()).collect();
            matches!(words.as_slice(), ["precision", _, "float", ";"]).then_some(s.end)
        })
    }

    fn matching_paren(&self, open: usize) -> Option<usize> {
        let depth = self.tokens.get(open)?.parens;
        self.tokens
            .iter()
            .enumerate()
            .skip(open + 1)
            .find(|(_, t)| t.text == ")" && t.parens == depth)
            .map(|(i, _)| i)
    }
}

fn tokenize(stripped: &str) -> (Vec<Token>, Vec<Directive>, Option<Imbalance>) {
    let bytes = stripped.as_bytes();
    let mut tokens = Vec::new();
    let mut directives = Vec::new();
    let mut imbalance: Option<Imbalance> = None;

    let mut depth = 0usize;
    let mut parens = 0usize;
    let mut brackets = 0usize;
    let mut line = 1usize;
    let mut at_line_start = true;
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i];

        if c == b'\n' {
            line += 1;
            at_line_start = true;
            i += 1;
            continue;
        }
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if c == b'#' && at_line_start {
            let start = i;
            let mut end = i;
            while end < bytes.len() && bytes[end] != b'\n' {
                end += 1;
            }
            let text = stripped[start..end].trim().to_string();
            let name = text[1..]
                .trim_start()
                .split(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                .next()
                .unwrap_or_default()
                .to_string();
            let line_start = stripped[..start].rfind('\n').map_or(0, |p| p + 1);
            let after = if end < bytes.len() { end + 1 } else { end };
            directives.push(Directive {
                name,
                text,
                line,
                start: line_start,
                end: after,
            });
            i = end;
            continue;
        }
        at_line_start = false;

        let start = i;
        if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
        } else if c.is_ascii_digit()
            || (c == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit))
        {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                i += 1;
            }
        } else {
            // Multi-byte characters outside comments are invalid GLSL anyway;
            // keep them as one token so offsets stay on char boundaries.
            let width = stripped[i..].chars().next().map_or(1, char::len_utf8);
            i += width;
        }
        let text = stripped[start..i].to_string();

        let (tok_depth, tok_parens) = match text.as_str() {
            "{" => {
                depth += 1;
                (depth - 1, parens)
            }
            "}" => {
                if depth == 0 {
                    imbalance.get_or_insert(Imbalance {
                        delimiter: '}',
                        line,
                    });
                } else {
                    depth -= 1;
                }
                (depth, parens)
            }
            "(" => {
                parens += 1;
                (depth, parens - 1)
            }
            ")" => {
                if parens == 0 {
                    imbalance.get_or_insert(Imbalance {
                        delimiter: ')',
                        line,
                    });
                } else {
                    parens -= 1;
                }
                (depth, parens)
            }
            "[" => {
                brackets += 1;
                (depth, parens)
            }
            "]" => {
                if brackets == 0 {
                    imbalance.get_or_insert(Imbalance {
                        delimiter: ']',
                        line,
                    });
                } else {
                    brackets -= 1;
                }
                (depth, parens)
            }
            _ => (depth, parens),
        };

        tokens.push(Token {
            text,
            start,
            end: i,
            line,
            depth: tok_depth,
            parens: tok_parens,
        });
    }

    if imbalance.is_none() {
        if depth > 0 {
            imbalance = Some(Imbalance {
                delimiter: '{',
                line,
            });
        } else if parens > 0 {
            imbalance = Some(Imbalance {
                delimiter: '(',
                line,
            });
        } else if brackets > 0 {
            imbalance = Some(Imbalance {
                delimiter: '[',
                line,
            });
        }
    }

    (tokens, directives, imbalance)
}

/// File-scope statements, ignoring anything inside braces or parentheses.
fn file_scope_statements(tokens: &[Token]) -> Vec<Statement> {
    let mut out = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    for (i, t) in tokens.iter().enumerate() {
        if t.depth != 0 {
            continue;
        }
        match t.text.as_str() {
            "{" | "(" | ")" => continue,
            // A closing brace at file scope ends a function body or block.
            "}" => current.clear(),
            _ if t.parens != 0 => continue,
            ";" => {
                current.push(i);
                out.push(Statement {
                    tokens: std::mem::take(&mut current),
                    end: t.end,
                });
            }
            _ => current.push(i),
        }
    }
    out
}

/// Global `uniform`/`in`/`out` declarations, including members of interface
/// blocks (`uniform Block { float x; };`).
fn collect_declarations(tokens: &[Token]) -> Vec<Declaration> {
    let mut out = Vec::new();
    let mut current: Vec<&Token> = Vec::new();
    let mut block_qualifier: Option<String> = None;
    let mut block_members: Vec<&Token> = Vec::new();

    for t in tokens {
        match (t.depth, t.text.as_str()) {
            (0, "{") => {
                let words: Vec<&str> = current.iter().map(|t| t.text.as_str()).collect();
                block_qualifier = words
                    .iter()
                    .find(|w| STORAGE_QUALIFIERS.contains(w))
                    .map(|w| (*w).to_string());
                current.clear();
            }
            (1, _) if block_qualifier.is_some() => {
                if t.text == ";" {
                    if let Some(q) = &block_qualifier {
                        if let Some(decl) = parse_member(q, &block_members) {
                            out.push(decl);
                        }
                    }
                    block_members.clear();
                } else if t.parens == 0 {
                    block_members.push(t);
                }
            }
            (0, "}") => {
                block_members.clear();
                current.clear();
            }
            (0, ";") => {
                if block_qualifier.take().is_none() {
                    if let Some(decl) = parse_declaration(&current) {
                        out.push(decl);
                    }
                }
                current.clear();
            }
            (0, "(" | ")") => {}
            (0, _) if t.parens == 0 => current.push(t),
            _ => {}
        }
    }
    out
}

fn parse_declaration(tokens: &[&Token]) -> Option<Declaration> {
    let mut qualifier: Option<&str> = None;
    let mut idx = 0;
    while let Some(t) = tokens.get(idx) {
        let word = t.text.as_str();
        if STORAGE_QUALIFIERS.contains(&word) {
            qualifier = Some(word);
        } else if !PASSTHROUGH_QUALIFIERS.contains(&word) && t.is_ident() {
            break;
        }
        idx += 1;
    }
    let qualifier = qualifier?;
    let ty = tokens.get(idx)?;
    let names = declared_names(&tokens[idx + 1..]);
    (!names.is_empty()).then(|| Declaration {
        qualifier: qualifier.to_string(),
        ty: ty.text.clone(),
        names,
        line: ty.line,
    })
}

fn parse_member(qualifier: &str, tokens: &[&Token]) -> Option<Declaration> {
    let idx = tokens
        .iter()
        .position(|t| t.is_ident() && !PASSTHROUGH_QUALIFIERS.contains(&t.text.as_str()))?;
    let ty = tokens[idx];
    let names = declared_names(&tokens[idx + 1..]);
    (!names.is_empty()).then(|| Declaration {
        qualifier: qualifier.to_string(),
        ty: ty.text.clone(),
        names,
        line: ty.line,
    })
}

/// Names in `a, b[4], c = 1.0` style declarator lists.
fn declared_names(tokens: &[&Token]) -> Vec<String> {
    let mut names = Vec::new();
    let mut expect_name = true;
    let mut in_brackets = 0usize;
    let mut in_initializer = false;
    for t in tokens {
        match t.text.as_str() {
            "[" => in_brackets += 1,
            "]" => in_brackets = in_brackets.saturating_sub(1),
            "=" => in_initializer = true,
            "," if in_brackets == 0 => {
                expect_name = true;
                in_initializer = false;
            }
            _ if expect_name && !in_initializer && in_brackets == 0 && t.is_ident() => {
                names.push(t.text.clone());
                expect_name = false;
            }
            _ => {}
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_are_blanked_but_offsets_survive() {
        let src = "a // iTime\n/* iResolution\n */ b";
        let stripped = strip_comments(src);
        assert_eq!(stripped.len(), src.len());
        assert!(!stripped.contains("iTime"));
        assert!(!stripped.contains("iResolution"));
        assert_eq!(stripped.matches('\n').count(), 2);
        assert_eq!(&stripped[stripped.len() - 1..], "b");
    }

    #[test]
    fn declarations_cover_arrays_lists_and_qualifiers() {
        let scan = GlslScan::new(
            "uniform vec3 iChannelResolution[4];\n\
             uniform highp float a, b;\n\
             layout(location = 0) out vec4 color;\n\
             in vec2 vUv;\n",
        );
        assert!(scan.declares("uniform", "iChannelResolution"));
        assert!(scan.declares("uniform", "a"));
        assert!(scan.declares("uniform", "b"));
        assert!(scan.declares("out", "color"));
        assert!(scan.declares("in", "vUv"));
        assert_eq!(scan.find_declaration("out", "vec4").unwrap().names, ["color"]);
    }

    #[test]
    fn function_parameters_are_not_globals() {
        let scan = GlslScan::new(
            "void mainImage(out vec4 fragColor, in vec2 fragCoord) { fragColor = vec4(1.0); }",
        );
        assert!(!scan.declares("out", "fragColor"));
        assert!(scan.defines_function("mainImage"));
        assert!(!scan.defines_function("main"));
    }

    #[test]
    fn prototypes_do_not_count_as_definitions() {
        let scan = GlslScan::new("void main();\nfloat f(float x) { return x; }");
        assert!(!scan.defines_function("main"));
        assert!(scan.defines_function("f"));
    }

    #[test]
    fn interface_block_members_are_declared() {
        let scan = GlslScan::new("uniform Globals { float iTime; vec3 iResolution; };\nvoid main() {}");
        assert!(scan.declares("uniform", "iTime"));
        assert!(scan.declares("uniform", "iResolution"));
        assert!(scan.defines_function("main"));
    }

    #[test]
    fn directives_and_precision_are_located() {
        let src = "#version 300 es\n#extension GL_EXT_foo : enable\nprecision highp float;\nvoid main() {}\n";
        let scan = GlslScan::new(src);
        let version = scan.directive("version").unwrap();
        assert_eq!(version.text, "#version 300 es");
        assert_eq!(version.start, 0);
        assert_eq!(version.end, "#version 300 es\n".len());
        assert_eq!(scan.directives().len(), 2);
        let end = scan.float_precision_end().unwrap();
        assert_eq!(&src[..end], "#version 300 es\n#extension GL_EXT_foo : enable\nprecision highp float;");
    }

    #[test]
    fn references_ignore_comments() {
        let scan = GlslScan::new("// iTime\nvoid main() { float t = iFrame; }");
        assert!(!scan.references("iTime"));
        assert!(scan.references("iFrame"));
    }

    #[test]
    fn imbalance_reports_delimiter_and_line() {
        let scan = GlslScan::new("void main() {\n  float x = (1.0;\n}");
        let err = scan.imbalance().unwrap();
        assert_eq!(err.delimiter, '(');

        let scan = GlslScan::new("void main() { }\n}");
        assert_eq!(scan.imbalance().unwrap().delimiter, '}');
        assert_eq!(scan.imbalance().unwrap().line, 2);

        assert!(GlslScan::new("void main() { float a[2]; }").imbalance().is_none());
    }
}
