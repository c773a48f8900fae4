//! Turns authored node source into a self-contained fragment compilation unit.
//!
//! ShaderToy-style sources only define `mainImage(out vec4, in vec2)` and
//! lean on the implicit `iTime`/`iResolution`/`iChannel*` interface. The
//! transform adds whatever is missing (version, precision, uniforms, an output
//! variable and a `main` wrapper) and nothing else. It is pure and idempotent:
//! transforming its own output changes nothing.

use crate::node::NodeKind;

use super::glsl_scan::GlslScan;
use super::uniforms::STANDARD_UNIFORMS;

pub const VERSION_DIRECTIVE: &str = "#version 300 es";
pub const DEFAULT_PRECISION: &str = "precision mediump float;";
const IMAGE_ENTRY_POINT: &str = "mainImage";
const DEFAULT_OUTPUT: &str = "fragColor";

/// What the transform changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformReport {
    pub image_entry_point: bool,
    pub added_version: bool,
    pub added_precision: bool,
    pub injected_uniforms: Vec<&'static str>,
    pub added_output: bool,
    pub added_entry_point: bool,
}

impl TransformReport {
    pub fn is_noop(&self) -> bool {
        !self.added_version
            && !self.added_precision
            && self.injected_uniforms.is_empty()
            && !self.added_output
            && !self.added_entry_point
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub source: String,
    pub report: TransformReport,
}

/// Transform `source` for a node of the given kind. Never fails: text that is
/// not valid GLSL passes through and fails later at compile time.
pub fn transform(source: &str, kind: NodeKind) -> TransformOutput {
    if kind == NodeKind::Texture {
        return TransformOutput {
            source: source.to_string(),
            report: TransformReport::default(),
        };
    }

    let scan = GlslScan::new(source);
    let mut report = TransformReport {
        image_entry_point: kind == NodeKind::Shader && scan.defines_function(IMAGE_ENTRY_POINT),
        ..TransformReport::default()
    };

    let missing: Vec<(&'static str, &'static str)> = STANDARD_UNIFORMS
        .iter()
        .copied()
        .filter(|(name, _)| !scan.declares("uniform", name))
        .collect();
    let wants_uniforms = if report.image_entry_point {
        !missing.is_empty()
    } else {
        missing.iter().any(|(name, _)| scan.references(name))
    };

    let mut header = String::new();
    let precision_end = scan.float_precision_end();
    if precision_end.is_none() {
        header.push_str(DEFAULT_PRECISION);
        header.push('\n');
        report.added_precision = true;
    }
    if wants_uniforms {
        for (name, decl) in &missing {
            header.push_str(decl);
            header.push('\n');
            report.injected_uniforms.push(name);
        }
    }

    let mut output_name = DEFAULT_OUTPUT.to_string();
    let mut footer = String::new();
    if report.image_entry_point {
        match scan.find_declaration("out", "vec4") {
            Some(decl) => {
                if let Some(name) = decl.names.first() {
                    output_name = name.clone();
                }
            }
            None => {
                header.push_str(&format!("out vec4 {DEFAULT_OUTPUT};\n"));
                report.added_output = true;
            }
        }
        if !scan.defines_function("main") {
            footer = format!(
                "void main() {{ {IMAGE_ENTRY_POINT}({output_name}, gl_FragCoord.xy); }}\n"
            );
            report.added_entry_point = true;
        }
    }

    let mut prefix = String::new();
    if report.image_entry_point && scan.directive("version").is_none() {
        prefix.push_str(VERSION_DIRECTIVE);
        prefix.push('\n');
        report.added_version = true;
    }

    if report.is_noop() {
        return TransformOutput {
            source: source.to_string(),
            report,
        };
    }

    let at = insertion_point(source, &scan, precision_end);
    let mut out = String::with_capacity(source.len() + prefix.len() + header.len() + footer.len() + 2);
    out.push_str(&prefix);
    out.push_str(&source[..at]);
    if at > 0 && !source[..at].ends_with('\n') && !header.is_empty() {
        out.push('\n');
    }
    out.push_str(&header);
    out.push_str(&source[at..]);
    if !footer.is_empty() {
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&footer);
    }

    TransformOutput { source: out, report }
}

/// Where injected declarations go: after the float precision statement (and
/// the rest of its line if that is blank), else after the `#version` and
/// `#extension` lines, else the top of the file.
fn insertion_point(source: &str, scan: &GlslScan, precision_end: Option<usize>) -> usize {
    if let Some(end) = precision_end {
        let rest = &source[end..];
        let line_end = rest.find('\n').map_or(rest.len(), |i| i + 1);
        return if rest[..line_end].trim().is_empty() {
            end + line_end
        } else {
            end
        };
    }
    scan.directives()
        .iter()
        .filter(|d| d.name == "version" || d.name == "extension")
        .map(|d| d.end)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::shaders::{DEFAULT_CONST_SOURCE, DEFAULT_SHADER_SOURCE};

    fn count(haystack: &str, needle: &str) -> usize {
        haystack.matches(needle).count()
    }

    #[test]
    fn default_shader_gets_uniforms_after_precision() {
        let out = transform(DEFAULT_SHADER_SOURCE, NodeKind::Shader);
        assert!(out.report.image_entry_point);
        assert_eq!(out.report.injected_uniforms.len(), STANDARD_UNIFORMS.len());
        assert!(!out.report.added_entry_point);
        assert!(!out.report.added_output);
        assert!(out.source.starts_with("#version 300 es\nprecision mediump float;\nuniform vec3 iResolution;\n"));
        for (_, decl) in STANDARD_UNIFORMS {
            assert_eq!(count(&out.source, decl), 1, "{decl}");
        }
    }

    #[test]
    fn bare_main_image_gets_full_scaffolding() {
        let src = "void mainImage(out vec4 c, in vec2 p) { c = vec4(p / iResolution.xy, 0.0, 1.0); }";
        let out = transform(src, NodeKind::Shader);
        let r = &out.report;
        assert!(r.added_version && r.added_precision && r.added_output && r.added_entry_point);
        assert!(out.source.starts_with("#version 300 es\nprecision mediump float;\n"));
        assert_eq!(count(&out.source, "out vec4 fragColor;"), 1);
        assert!(out.source.ends_with("void main() { mainImage(fragColor, gl_FragCoord.xy); }\n"));
    }

    #[test]
    fn existing_output_name_is_reused() {
        let src = "#version 300 es\nprecision highp float;\nout vec4 color;\n\
                   void mainImage(out vec4 c, in vec2 p) { c = vec4(1.0); }\n";
        let out = transform(src, NodeKind::Shader);
        assert!(!out.report.added_output);
        assert!(!out.report.added_precision);
        assert!(out.source.contains("mainImage(color, gl_FragCoord.xy)"));
        assert_eq!(count(&out.source, "precision"), 1);
    }

    #[test]
    fn partially_declared_uniforms_are_completed_not_duplicated() {
        let src = "#version 300 es\nprecision mediump float;\nuniform float iTime;\nout vec4 o;\n\
                   void mainImage(out vec4 c, in vec2 p) { c = vec4(iTime); }\n\
                   void main() { mainImage(o, gl_FragCoord.xy); }\n";
        let out = transform(src, NodeKind::Shader);
        assert!(!out.report.injected_uniforms.contains(&"iTime"));
        assert_eq!(out.report.injected_uniforms.len(), STANDARD_UNIFORMS.len() - 1);
        assert_eq!(count(&out.source, "uniform float iTime;"), 1);
    }

    #[test]
    fn insertion_follows_version_and_extensions_without_precision() {
        let src = "#version 300 es\n#extension GL_OES_standard_derivatives : enable\n\
                   out vec4 o;\nvoid mainImage(out vec4 c, in vec2 p) { c = vec4(0.0); }\n";
        let out = transform(src, NodeKind::Shader);
        assert!(out.source.starts_with(
            "#version 300 es\n#extension GL_OES_standard_derivatives : enable\nprecision mediump float;\n"
        ));
    }

    #[test]
    fn raw_main_without_references_only_gains_precision() {
        let src = "#version 300 es\nout vec4 o;\nvoid main() { o = vec4(1.0); }\n";
        let out = transform(src, NodeKind::Shader);
        assert!(out.report.added_precision);
        assert!(out.report.injected_uniforms.is_empty());
        assert_eq!(out.source, "#version 300 es\nprecision mediump float;\nout vec4 o;\nvoid main() { o = vec4(1.0); }\n");
    }

    #[test]
    fn raw_main_referencing_time_gets_uniforms() {
        let src = "#version 300 es\nprecision mediump float;\nout vec4 o;\n\
                   void main() { o = vec4(sin(iTime)); }\n";
        let out = transform(src, NodeKind::Shader);
        assert!(out.report.injected_uniforms.contains(&"iTime"));
        assert!(!out.report.added_entry_point);
    }

    #[test]
    fn references_in_comments_do_not_trigger_injection() {
        let src = "#version 300 es\nprecision mediump float;\nout vec4 o;\n\
                   // uses iTime later\nvoid main() { o = vec4(1.0); }\n";
        assert!(transform(src, NodeKind::Const).report.is_noop());
    }

    #[test]
    fn const_default_is_left_alone() {
        let out = transform(DEFAULT_CONST_SOURCE, NodeKind::Const);
        assert!(out.report.is_noop());
        assert_eq!(out.source, DEFAULT_CONST_SOURCE);
    }

    #[test]
    fn texture_sources_pass_through() {
        let out = transform("anything at all", NodeKind::Texture);
        assert_eq!(out.source, "anything at all");
        assert!(out.report.is_noop());
    }

    #[test]
    fn output_is_a_fixed_point() {
        for src in [
            DEFAULT_SHADER_SOURCE,
            "void mainImage(out vec4 c, in vec2 p) { c = texture(iChannel0, p); }",
            "precision highp float; void main() { gl_FragColor = vec4(iTime); }",
        ] {
            let once = transform(src, NodeKind::Shader);
            let twice = transform(&once.source, NodeKind::Shader);
            assert!(twice.report.is_noop(), "{:?}", twice.report);
            assert_eq!(once.source, twice.source);
        }
    }
}
