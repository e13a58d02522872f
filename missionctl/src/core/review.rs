//! Review verdict markers in a worker response.

use crate::core::render::truncate_chars;

pub const APPROVED_MARKER: &str = "[APPROVED]";
pub const REVISION_MARKER: &str = "[REVISION]";
/// Markers only count near the start of the response.
pub const MARKER_WINDOW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approved,
    Revision,
    /// No marker: the review did not reach a decision.
    Undecided,
}

pub fn review_verdict(response: &str) -> ReviewVerdict {
    let head = truncate_chars(response, MARKER_WINDOW_CHARS);
    if head.contains(REVISION_MARKER) {
        ReviewVerdict::Revision
    } else if head.contains(APPROVED_MARKER) {
        ReviewVerdict::Approved
    } else {
        ReviewVerdict::Undecided
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_near_start_is_detected() {
        assert_eq!(review_verdict("[APPROVED] looks good"), ReviewVerdict::Approved);
    }

    #[test]
    fn revision_wins_over_approval() {
        assert_eq!(
            review_verdict("[REVISION] fix intro. Otherwise [APPROVED]"),
            ReviewVerdict::Revision
        );
    }

    #[test]
    fn marker_past_window_is_ignored() {
        let late = format!("{}[APPROVED]", "x".repeat(MARKER_WINDOW_CHARS));
        assert_eq!(review_verdict(&late), ReviewVerdict::Undecided);
    }
}
