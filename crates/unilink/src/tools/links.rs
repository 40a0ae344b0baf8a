use unilink_core::link_parser::{self, ReferenceSpan};
use unilink_core::Variant;

/// Execute the `links` tool: list the references the matcher recognizes in
/// `content`, grouped by variant.
pub fn execute(content: &str) -> String {
    let spans = link_parser::extract_references(content);

    let mut output = String::new();
    section(&mut output, "Bracket references:", &spans, Variant::Bracket);
    output.push('\n');
    section(&mut output, "Tags:", &spans, Variant::Tag);
    output
}

fn section(output: &mut String, heading: &str, spans: &[ReferenceSpan], variant: Variant) {
    output.push_str(heading);
    output.push('\n');
    let mut any = false;
    for span in spans.iter().filter(|s| s.variant == variant) {
        any = true;
        let external = if link_parser::is_external(&span.raw) {
            " (external)"
        } else {
            ""
        };
        output.push_str(&format!(
            "- {} at {}..{}{}\n",
            span.raw, span.start, span.end, external
        ));
    }
    if !any {
        output.push_str("- (none)\n");
    }
}
