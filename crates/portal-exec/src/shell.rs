//! Shell command construction for one-shot execs.

use thiserror::Error;

/// Shell quoting error.
#[derive(Debug, Error)]
#[error("Failed to quote argument: {0}")]
pub struct QuoteError(#[from] shlex::QuoteError);

/// Quote one argument for `sh`.
///
/// # Errors
/// Returns error if the argument contains a NUL byte.
pub fn quote(arg: &str) -> Result<String, QuoteError> {
    Ok(shlex::try_quote(arg)?.into_owned())
}

/// Wrap a script as `sh -c <script>`.
#[must_use]
pub fn sh_c(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.into()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain_and_special() {
        assert_eq!(quote("/workspace/a.txt").unwrap(), "/workspace/a.txt");
        assert_eq!(quote("my file").unwrap(), "'my file'");
        assert!(quote("bad\0arg").is_err());
    }

    #[test]
    fn test_sh_c() {
        assert_eq!(sh_c("echo hi"), vec!["sh", "-c", "echo hi"]);
    }
}
