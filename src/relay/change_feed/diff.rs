//! Turning whole-row change notifications into semantic session events.
//!
//! The feed only says "this row now looks like X". Joins and leaves are recovered by
//! comparing the participant sets of the previous and current row images.

use crate::sessions::model::{EndReason, Session, SessionEvent};

/// Compute the events that take a session row from `previous` to `current`.
///
/// - `None -> Some` is an insert: `Created`.
/// - `Some -> None` is a delete: `Ended` (reason [`EndReason::Removed`]; callers that know
///   better may overwrite it).
/// - `Some -> Some` yields `ParticipantLeft` for every user that disappeared, then
///   `ParticipantJoined` for every newcomer, then `StateUpdated` if the state differs.
///   A newer row with unchanged membership is a state write even when the value is the same,
///   so a resubmitted state is echoed just as the push relay echoes it.
///   Each event carries the current row as its snapshot.
#[must_use]
pub fn diff_rows(previous: Option<&Session>, current: Option<&Session>) -> Vec<SessionEvent> {
    match (previous, current) {
        (None, None) => Vec::new(),
        (None, Some(current)) => vec![SessionEvent::Created {
            session: current.clone(),
        }],
        (Some(previous), None) => vec![SessionEvent::Ended {
            session: previous.clone(),
            reason: EndReason::Removed,
        }],
        (Some(previous), Some(current)) => {
            let left = previous
                .participants
                .difference(&current.participants)
                .map(|user_id| SessionEvent::ParticipantLeft {
                    session: current.clone(),
                    user_id: user_id.clone(),
                });
            let joined = current
                .participants
                .difference(&previous.participants)
                .map(|user_id| SessionEvent::ParticipantJoined {
                    session: current.clone(),
                    user_id: user_id.clone(),
                });

            let mut events: Vec<SessionEvent> = left.chain(joined).collect();
            let rewritten = events.is_empty() && current.updated_at > previous.updated_at;
            if previous.state != current.state || rewritten {
                events.push(SessionEvent::StateUpdated {
                    session: current.clone(),
                });
            }
            events
        }
    }
}
