use core::fmt;
use std::string::String;

/// Where a call came from, saved per frame and reported to applied methods.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CallOrigin {
    #[default]
    Driver,
    Local,
    CallOther,
    Efun,
    FunctionPointer,
}

/// Non-local failure raised by bytecode or by the frame machinery. A raised
/// error unwinds to the nearest catch landmark; the remaining variants are
/// never stopped by a catch and always reach the outermost handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThreadError {
    /// Runtime error or explicit throw. The value a catch pushes travels in
    /// the thread's catch register, not here.
    Raised(String),
    /// Frame stack grew past the call-depth limit.
    TooDeepRecursion,
    /// Evaluation-cost limit exhausted (accounted for externally).
    EvalCostTooBig,
    /// Error-context nesting limit hit while entering a catch.
    ContextsTooDeep,
    /// Value stack grew past its limit.
    StackOverflow,
    /// More values popped than the current computation pushed.
    StackUnderflow,
}

impl ThreadError {
    pub fn raised(msg: &str) -> Self {
        Self::Raised(String::from(msg))
    }

    /// Whether a catch frame may stop this failure.
    #[inline]
    pub const fn is_catchable(&self) -> bool {
        matches!(
            self,
            Self::Raised(_) | Self::StackOverflow | Self::StackUnderflow
        )
    }
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raised(msg) => f.write_str(msg),
            Self::TooDeepRecursion => f.write_str("too deep recursion"),
            Self::EvalCostTooBig => f.write_str("evaluation cost too big"),
            Self::ContextsTooDeep => f.write_str("error contexts nested too deep"),
            Self::StackOverflow => f.write_str("evaluation stack overflow"),
            Self::StackUnderflow => f.write_str("evaluation stack underflow"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ThreadError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catchability() {
        assert!(ThreadError::raised("boom").is_catchable());
        assert!(ThreadError::StackOverflow.is_catchable());
        assert!(!ThreadError::TooDeepRecursion.is_catchable());
        assert!(!ThreadError::EvalCostTooBig.is_catchable());
        assert!(!ThreadError::ContextsTooDeep.is_catchable());
    }
}
