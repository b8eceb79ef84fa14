//! Time-gated activation.
//!
//! An upgrade group annotated with [`NOT_BEFORE_ANNOTATION`] makes no
//! changes until the wall clock reaches the annotated unix time.

use std::time::Duration;

use warpfleet_state::Labels;

pub const NOT_BEFORE_ANNOTATION: &str = "rollout.warpfleet.dev/not-before";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// No annotation, or its time has come.
    Open,
    /// Closed until `not_before`; `remaining` from now.
    Closed { not_before: u64, remaining: Duration },
    /// The annotation is not a unix timestamp.
    Invalid { value: String, reason: String },
}

/// Evaluate the gate at unix time `now`.
pub fn evaluate(annotations: &Labels, now: u64) -> Gate {
    let Some(raw) = annotations.get(NOT_BEFORE_ANNOTATION) else {
        return Gate::Open;
    };
    match raw.trim().parse::<u64>() {
        Ok(not_before) if now >= not_before => Gate::Open,
        Ok(not_before) => Gate::Closed {
            not_before,
            remaining: Duration::from_secs(not_before - now),
        },
        Err(e) => Gate::Invalid {
            value: raw.clone(),
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotated(value: &str) -> Labels {
        [(NOT_BEFORE_ANNOTATION.to_string(), value.to_string())].into()
    }

    #[test]
    fn missing_annotation_is_open() {
        assert_eq!(evaluate(&Labels::new(), 100), Gate::Open);
    }

    #[test]
    fn opens_at_the_annotated_time() {
        assert_eq!(evaluate(&annotated("100"), 100), Gate::Open);
        assert_eq!(evaluate(&annotated("100"), 250), Gate::Open);
    }

    #[test]
    fn closed_before_the_annotated_time() {
        assert_eq!(
            evaluate(&annotated(" 160 "), 100),
            Gate::Closed {
                not_before: 160,
                remaining: Duration::from_secs(60),
            }
        );
    }

    #[test]
    fn garbage_is_invalid() {
        for value in ["tomorrow", "", "-5", "1.5"] {
            assert!(
                matches!(evaluate(&annotated(value), 100), Gate::Invalid { .. }),
                "{value:?}"
            );
        }
    }
}
