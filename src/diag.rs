//! Diagnostic accumulation.
//!
//! Input-format and layout problems are fatal and travel as `Err(String)`.
//! Resolution problems (undefined symbols, duplicate definitions) are pushed
//! here so one run reports them all, then `finish()` turns a non-empty sink
//! into a single failure.

/// Collects nonfatal diagnostics during resolution.
pub struct DiagSink {
    errors: Vec<String>,
    warnings: Vec<String>,
    pub verbose: bool,
}

impl DiagSink {
    pub fn new(verbose: bool) -> Self {
        Self { errors: Vec::new(), warnings: Vec::new(), verbose }
    }

    pub fn error(&mut self, msg: String) {
        self.errors.push(msg);
    }

    pub fn warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Progress chatter, only under --verbose.
    pub fn log(&self, msg: &str) {
        if self.verbose {
            eprintln!("rld: {}", msg);
        }
    }

    /// Print warnings, then fail if any errors accumulated.
    pub fn finish(&self) -> Result<(), String> {
        for w in &self.warnings {
            eprintln!("rld: warning: {}", w);
        }
        match self.errors.as_slice() {
            [] => Ok(()),
            [single] => Err(single.clone()),
            many => {
                for e in &many[..many.len() - 1] {
                    eprintln!("rld: error: {}", e);
                }
                Err(many[many.len() - 1].clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sink_passes() {
        let sink = DiagSink::new(false);
        assert!(sink.finish().is_ok());
    }

    #[test]
    fn errors_accumulate_and_fail_at_end() {
        let mut sink = DiagSink::new(false);
        sink.error("undefined symbol: foo".to_string());
        sink.error("undefined symbol: bar".to_string());
        assert_eq!(sink.error_count(), 2);
        let err = sink.finish().unwrap_err();
        assert!(err.contains("bar"));
    }
}
