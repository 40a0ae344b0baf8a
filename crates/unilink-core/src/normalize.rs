use unicode_normalization::UnicodeNormalization;

/// Fold a raw reference string to its lookup key.
///
/// Compatibility normalization runs first so that full-width forms (including
/// the ideographic space U+3000 and the full-width low line) become their
/// ASCII counterparts before underscores and whitespace are folded. Case is
/// preserved: `Test Page` and `test page` are distinct keys.
pub fn normalize(raw: &str) -> String {
    let folded: String = raw.nfkc().collect();
    folded
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
