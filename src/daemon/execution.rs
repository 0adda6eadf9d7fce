//! Outcome of one build run through the daemon.

use crate::error::{AnvilError, Result};

/// Exit code reported when the build was cancelled by the user.
pub const CANCELED_EXIT_CODE: i32 = 130;

/// The result of an `anvil` build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionResult {
    exit_code: i32,
}

impl ExecutionResult {
    pub fn new(exit_code: i32) -> Self {
        Self { exit_code }
    }

    pub fn canceled() -> Self {
        Self::new(CANCELED_EXIT_CODE)
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn assert_success(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(AnvilError::BuildAssertion(format!(
                "the build was expected to succeed but exited with code {}",
                self.exit_code
            )))
        }
    }

    pub fn assert_failure(self) -> Result<Self> {
        if self.is_success() {
            Err(AnvilError::BuildAssertion(
                "the build was expected to fail but succeeded".into(),
            ))
        } else {
            Ok(self)
        }
    }
}

/// Format a build command line the way it appears in logs and diagnostics:
/// the binary name followed by each argument in literal double quotes.
/// Embedded quotes are not escaped; this matches the logged form.
pub fn command_line(args: &[String]) -> String {
    let mut buffer = String::from("anvil");
    for arg in args {
        buffer.push_str(" \"");
        buffer.push_str(arg);
        buffer.push('"');
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_code_is_success() {
        let result = ExecutionResult::new(0);
        assert!(result.is_success());
        assert_eq!(result.exit_code(), 0);
        assert!(result.assert_success().is_ok());
        assert!(result.assert_failure().is_err());
    }

    #[test]
    fn nonzero_exit_code_is_failure() {
        let result = ExecutionResult::new(42);
        assert!(!result.is_success());
        assert!(result.assert_failure().is_ok());
        let err = result.assert_success().unwrap_err();
        assert!(err.to_string().contains("exited with code 42"));
    }

    #[test]
    fn canceled_result_uses_the_interrupt_code() {
        assert_eq!(ExecutionResult::canceled().exit_code(), CANCELED_EXIT_CODE);
    }

    #[test]
    fn command_line_quotes_each_argument() {
        let args = vec!["clean".to_string(), "install".to_string()];
        assert_eq!(command_line(&args), "anvil \"clean\" \"install\"");
    }

    #[test]
    fn command_line_does_not_escape_embedded_quotes() {
        let args = vec!["say \"hi\"".to_string()];
        assert_eq!(command_line(&args), "anvil \"say \"hi\"\"");
    }
}
