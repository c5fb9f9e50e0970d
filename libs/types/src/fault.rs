//! Invariant-violation policy.
//!
//! Some states indicate a design bug rather than an environmental
//! failure: a container id hosted by two agents after convergence, a
//! broadcaster that never emits, a command resolving in a state the FSM
//! forbids. Continuing would corrupt state, so these panic in debug
//! builds and log fatally then exit in release builds.

/// Report an invariant violation and never return.
pub fn invariant_violation(component: &str, msg: &str) -> ! {
    if cfg!(debug_assertions) {
        panic!("invariant violation in {component}: {msg}");
    }
    tracing::error!(component, "invariant violation: {msg}");
    std::process::exit(70);
}

/// Assert an invariant, reporting through [`invariant_violation`] on
/// failure.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $component:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::fault::invariant_violation($component, &format!($($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    #[test]
    #[should_panic(expected = "invariant violation in test")]
    fn test_violation_panics_in_debug() {
        super::invariant_violation("test", "boom");
    }

    #[test]
    #[should_panic(expected = "two agents")]
    fn test_invariant_macro_fires() {
        crate::invariant!(false, "reconciler", "two agents host {}", "h-0");
    }

    #[test]
    fn test_invariant_macro_passes() {
        crate::invariant!(true, "reconciler", "unused");
    }
}
