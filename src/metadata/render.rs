//! Collapsible presentation for encoded blocks.
//!
//! Wrapping only adds lines around the block; markers stay at the start of
//! their own lines, so a wrapped block decodes exactly like a bare one.

/// Wrap an encoded region in a `<details>` section titled with its key.
pub fn render_collapsible(key: &str, region: &str) -> String {
    format!(
        "<details>\n<summary><code>{}</code></summary>\n\n{}\n\n</details>",
        key,
        region.trim_end()
    )
}

/// Remove `<details>` wrappers added by [`render_collapsible`], leaving the
/// marker text untouched.
pub fn strip_presentation(text: &str) -> String {
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| {
            let t = line.trim();
            !(t == "<details>"
                || t == "</details>"
                || (t.starts_with("<summary>") && t.ends_with("</summary>")))
        })
        .collect();
    kept.join("\n").trim().to_string()
}
