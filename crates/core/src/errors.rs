use std::fmt;

/// Collects error messages from independent steps and reports them as one error.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{}", .messages.join("\n"))]
pub struct ErrorList {
    messages: Vec<String>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: impl fmt::Display) {
        self.messages.push(err.to_string());
    }

    /// Appends the error of a failed result, ignoring successes.
    pub fn push_result<T, E: fmt::Display>(&mut self, res: Result<T, E>) {
        if let Err(e) = res {
            self.push(e);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), ErrorList> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl<S: Into<String>> FromIterator<S> for ErrorList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self { messages: iter.into_iter().map(Into::into).collect() }
    }
}
