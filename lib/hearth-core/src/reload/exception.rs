use super::{EventSources, ReloadEvent, ReloadStrategy};
use crate::error::GenericError;

type IgnorePredicate = Box<dyn Fn(&GenericError) -> bool>;

/// Reloads the worker once a number of errors have been raised.
///
/// Errors matching the ignore predicate, if one is set, are not counted. This is typically used to skip errors that
/// are caused by clients rather than by the worker itself, such as rejected requests.
pub struct ExceptionReloadStrategy {
    threshold: usize,
    observed: usize,
    ignore: Option<IgnorePredicate>,
}

impl ExceptionReloadStrategy {
    /// Creates a new `ExceptionReloadStrategy` that reloads on the first error.
    pub fn new() -> Self {
        Self {
            threshold: 1,
            observed: 0,
            ignore: None,
        }
    }

    /// Sets the number of errors after which the worker is reloaded.
    ///
    /// A threshold of zero is treated as one.
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    /// Sets a predicate for errors that should not be counted.
    pub fn with_ignore<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&GenericError) -> bool + 'static,
    {
        self.ignore = Some(Box::new(predicate));
        self
    }
}

impl Default for ExceptionReloadStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReloadStrategy for ExceptionReloadStrategy {
    fn name(&self) -> &'static str {
        "exception"
    }

    fn interests(&self) -> EventSources {
        EventSources::Exception
    }

    fn should_reload(&mut self, event: &ReloadEvent<'_>) -> bool {
        let ReloadEvent::Exception(error) = event else {
            return false;
        };

        if self.ignore.as_ref().is_some_and(|ignore| ignore(error)) {
            return false;
        }

        self.observed = self.observed.saturating_add(1);
        self.observed == self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generic_error;

    #[derive(Debug)]
    struct ClientError;

    impl std::fmt::Display for ClientError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("bad request")
        }
    }

    impl std::error::Error for ClientError {}

    #[test]
    fn fires_on_first_error_by_default() {
        let mut strategy = ExceptionReloadStrategy::new();
        assert!(strategy.should_reload(&ReloadEvent::Exception(&generic_error!("boom"))));
    }

    #[test]
    fn ignored_errors_are_not_counted() {
        let mut strategy = ExceptionReloadStrategy::new()
            .with_threshold(2)
            .with_ignore(|e| e.downcast_ref::<ClientError>().is_some());

        let client = GenericError::new(ClientError);
        let server = generic_error!("database unavailable");

        assert!(!strategy.should_reload(&ReloadEvent::Exception(&client)));
        assert!(!strategy.should_reload(&ReloadEvent::Exception(&server)));
        assert!(!strategy.should_reload(&ReloadEvent::Exception(&client)));
        assert!(strategy.should_reload(&ReloadEvent::Exception(&server)));
    }

    #[test]
    fn non_exception_events_are_ignored() {
        let mut strategy = ExceptionReloadStrategy::new();
        assert!(!strategy.should_reload(&ReloadEvent::Request));
        assert!(!strategy.should_reload(&ReloadEvent::Timer));
    }
}
