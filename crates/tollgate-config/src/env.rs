use std::sync::OnceLock;

use regex::Regex;

/// Failure while substituting placeholders in raw config text
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExpandError {
    /// Referenced variable is unset and has no default
    #[error("environment variable not found: `{0}` (line {1})")]
    Missing(String, usize),
    /// Placeholder uses a scope other than `env.`
    #[error("only variables scoped with 'env.' are supported: `{0}` (line {1})")]
    UnsupportedScope(String, usize),
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `{{ env.NAME }}` or `{{ env.NAME | default("value") }}`
    RE.get_or_init(|| {
        Regex::new(r#"\{\{\s*([A-Za-z0-9_.]+)\s*(?:\|\s*default\("([^"]*)"\))?\s*\}\}"#)
            .expect("must be valid regex")
    })
}

/// Substitute `{{ env.VAR }}` placeholders in raw TOML before parsing
///
/// Comment lines are copied through untouched so commented-out settings never
/// require their variables to be set.
pub fn expand_env(input: &str) -> Result<String, ExpandError> {
    let mut output = String::with_capacity(input.len());

    for (index, line) in input.lines().enumerate() {
        let line_no = index + 1;
        if index > 0 {
            output.push('\n');
        }

        if line.trim_start().starts_with('#') {
            output.push_str(line);
            continue;
        }

        let mut cursor = 0;
        for captures in placeholder().captures_iter(line) {
            let (Some(whole), Some(key)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            output.push_str(&line[cursor..whole.start()]);

            let Some(var_name) = key.as_str().strip_prefix("env.").filter(|name| !name.contains('.')) else {
                return Err(ExpandError::UnsupportedScope(key.as_str().to_owned(), line_no));
            };

            match (std::env::var(var_name), captures.get(2)) {
                (Ok(value), _) => output.push_str(&value),
                (Err(_), Some(default)) => output.push_str(default.as_str()),
                (Err(_), None) => return Err(ExpandError::Missing(var_name.to_owned(), line_no)),
            }

            cursor = whole.end();
        }
        output.push_str(&line[cursor..]);
    }

    if input.ends_with('\n') {
        output.push('\n');
    }

    Ok(output)
}
