// Execution context model: where a step must run and where a chain currently is.

use std::fmt;

/// The two execution contexts a chain can be on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionContext {
    /// The host's single privileged thread.
    Main,
    /// Any thread that is not the main thread.
    Background,
}

impl ExecutionContext {
    /// Context of the calling thread, as reported by `is_main_thread`.
    pub fn from_main_flag(is_main_thread: bool) -> Self {
        if is_main_thread {
            ExecutionContext::Main
        } else {
            ExecutionContext::Background
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionContext::Main => write!(f, "main"),
            ExecutionContext::Background => write!(f, "background"),
        }
    }
}

/// A step's declared requirement on its execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affinity {
    /// Must run on the main thread.
    Main,
    /// Must run off the main thread.
    Background,
    /// Runs wherever the chain currently is.
    Inherit,
}

impl Affinity {
    /// Resolve against the chain's current context. `Inherit` never causes a hop.
    pub fn resolve(self, current: ExecutionContext) -> ExecutionContext {
        match self {
            Affinity::Main => ExecutionContext::Main,
            Affinity::Background => ExecutionContext::Background,
            Affinity::Inherit => current,
        }
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Affinity::Main => write!(f, "MAIN"),
            Affinity::Background => write!(f, "BACKGROUND"),
            Affinity::Inherit => write!(f, "INHERIT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inherit_follows_current_context() {
        assert_eq!(
            Affinity::Inherit.resolve(ExecutionContext::Main),
            ExecutionContext::Main
        );
        assert_eq!(
            Affinity::Inherit.resolve(ExecutionContext::Background),
            ExecutionContext::Background
        );
    }

    #[test]
    fn test_explicit_affinity_ignores_current_context() {
        assert_eq!(
            Affinity::Main.resolve(ExecutionContext::Background),
            ExecutionContext::Main
        );
        assert_eq!(
            Affinity::Background.resolve(ExecutionContext::Main),
            ExecutionContext::Background
        );
    }

    #[test]
    fn test_from_main_flag() {
        assert_eq!(ExecutionContext::from_main_flag(true), ExecutionContext::Main);
        assert_eq!(
            ExecutionContext::from_main_flag(false),
            ExecutionContext::Background
        );
    }
}
