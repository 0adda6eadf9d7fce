//! Output formatting for CLI commands.

/// Trait for command outputs that can be formatted in multiple ways.
pub trait Output {
    /// Format as JSON
    fn to_json(&self) -> String;

    /// Format as text (human-readable)
    fn to_text(&self) -> String;

    fn format(&self, json: bool) -> String {
        if json {
            self.to_json()
        } else {
            self.to_text()
        }
    }
}

/// Print an output in the requested format.
pub fn print(output: &impl Output, json: bool) {
    println!("{}", output.format(json));
}
