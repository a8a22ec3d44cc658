use std::fmt;
use std::sync::Arc;

use tupledb_common::protocol::error::ClientError;

/// Decides whether a failure is worth another attempt.
///
/// Cheap to clone; the predicate is shared.
#[derive(Clone)]
pub struct ErrorClassifier {
    name: &'static str,
    predicate: Arc<dyn Fn(&ClientError) -> bool + Send + Sync>,
}

impl ErrorClassifier {
    pub fn new<F>(name: &'static str, predicate: F) -> Self
    where
        F: Fn(&ClientError) -> bool + Send + Sync + 'static,
    {
        Self {
            name,
            predicate: Arc::new(predicate),
        }
    }

    pub fn retry_all() -> Self {
        Self::new("all", |_| true)
    }

    pub fn retry_none() -> Self {
        Self::new("none", |_| false)
    }

    /// Connection errors, timeouts, dropped connections and an empty pool.
    pub fn retry_network_errors() -> Self {
        Self::new("network", ClientError::is_network_error)
    }

    /// Server says the called function is not defined. Useful while a
    /// rolling upgrade is still registering functions.
    pub fn retry_no_such_procedure() -> Self {
        Self::new("no_such_procedure", ClientError::is_no_such_procedure)
    }

    /// Accepts a failure when either classifier does.
    pub fn or(self, other: ErrorClassifier) -> Self {
        let (a, b) = (self.predicate, other.predicate);
        Self {
            name: "combined",
            predicate: Arc::new(move |e| a(e) || b(e)),
        }
    }

    pub fn test(&self, error: &ClientError) -> bool {
        (self.predicate)(error)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::retry_network_errors()
    }
}

impl fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorClassifier").field(&self.name).finish()
    }
}
