//! Fixed shader stages and the default node sources.

/// Pass-through vertex stage shared by every node program. The clip-space
/// position comes straight from the quad buffer.
pub const NODE_VERTEX_SOURCE: &str = "#version 300 es
in vec4 position;
void main() { gl_Position = position; }
";

/// Vertex stage of the blit program; forwards a 0..1 texture coordinate.
pub const BLIT_VERTEX_SOURCE: &str = "#version 300 es
in vec4 position;
out vec2 vUv;
void main() { vUv = position.xy * 0.5 + 0.5; gl_Position = position; }
";

pub const BLIT_FRAGMENT_SOURCE: &str = "#version 300 es
precision mediump float;
uniform sampler2D uTex;
in vec2 vUv;
out vec4 outColor;
void main() { outColor = texture(uTex, vUv); }
";

/// Sampler uniform of the blit program, always fed from texture unit 0.
pub const BLIT_SAMPLER_UNIFORM: &str = "uTex";

/// Name of the vertex attribute fed from the quad buffer.
pub const POSITION_ATTRIBUTE: &str = "position";

/// Full-screen quad drawn as a 4-vertex triangle strip.
pub const QUAD_VERTICES: [f32; 8] = [-1.0, -1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0];

/// Source every new node starts with: the classic cosine palette sweep.
pub const DEFAULT_SHADER_SOURCE: &str = "#version 300 es
precision mediump float;
out vec4 fragColor;
void mainImage( out vec4 fragColor, in vec2 fragCoord ) {
    vec2 uv = fragCoord/iResolution.xy;
    vec3 col = 0.5 + 0.5*cos(iTime+uv.xyx+vec3(0,2,4));
    fragColor = vec4(col,1.0);
}
void main() { mainImage(fragColor, gl_FragCoord.xy); }
";

/// Source given to a node switched to `const` while it still holds the
/// default shader: opaque white.
pub const DEFAULT_CONST_SOURCE: &str = "#version 300 es
precision mediump float;
out vec4 fragColor;
void main() {
    fragColor = vec4(1.000, 1.000, 1.000, 1.0);
}
";

/// Canonical const-node source for a solid RGB color (components in 0..1).
pub fn const_color_source(rgb: [f32; 3]) -> String {
    let [r, g, b] = rgb.map(|c| c.clamp(0.0, 1.0));
    format!(
        "#version 300 es
precision mediump float;
out vec4 fragColor;
void main() {{
    fragColor = vec4({r:.3}, {g:.3}, {b:.3}, 1.0);
}}
"
    )
}

/// Recover the color written by a const-node source, i.e. the first three
/// components of the first `vec4(` literal.
pub fn parse_const_color(source: &str) -> Option<[f32; 3]> {
    let start = source.find("vec4(")? + "vec4(".len();
    let args = &source[start..];
    let end = args.find(')')?;
    let mut parts = args[..end].split(',').map(|p| p.trim().parse::<f32>());
    let r = parts.next()?.ok()?;
    let g = parts.next()?.ok()?;
    let b = parts.next()?.ok()?;
    Some([r, g, b])
}

/// Convert a color to the `#rrggbb` form used by color pickers.
pub fn rgb_to_hex(rgb: [f32; 3]) -> String {
    let [r, g, b] = rgb.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
    format!("#{r:02x}{g:02x}{b:02x}")
}

pub fn hex_to_rgb(hex: &str) -> Option<[f32; 3]> {
    let hex = hex.trim().strip_prefix('#')?;
    if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([
        channel(0)? as f32 / 255.0,
        channel(2)? as f32 / 255.0,
        channel(4)? as f32 / 255.0,
    ])
}
