//! The prompt delivery state machine.
//!
//! [`next_decision`] is a pure function from an instance's current state
//! and age to the action the scan should take. Rules fire in priority
//! order: expiry first, then opt-out, then the send progression. An
//! expired instance never gets a message in the same pass that expires
//! it, and an opt-out never resurrects an already-expired instance.

use ema_core::Schedule;
use ema_core::instance::PromptStatus;

/// Which message template a due send uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Initial,
    Reminder1,
    Reminder2,
}

/// What the scan should do with one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDecision {
    /// Nothing due yet.
    Leave,
    /// Window expired: `Missed` if nothing was ever sent, `WindowClosed`
    /// otherwise.
    Expire(PromptStatus),
    /// Record opted out mid-window.
    OptOut,
    /// A message is due. On transport success the instance moves to
    /// `on_success`; on failure it moves to `SendError` with
    /// `on_success` recorded as the retry target.
    Send {
        kind: MessageKind,
        on_success: PromptStatus,
    },
}

/// The message a state is waiting to send next, with its age gate.
/// `SendError` retries the class it failed to deliver.
fn pending_send(
    status: PromptStatus,
    retry_target: Option<PromptStatus>,
    age_minutes: i64,
    schedule: &Schedule,
) -> ScanDecision {
    use PromptStatus::*;
    let due = |kind, on_success| ScanDecision::Send { kind, on_success };
    match status {
        Scheduled if age_minutes >= 0 => due(MessageKind::Initial, NotificationSent),
        NotificationSent => match schedule.reminders.first() {
            Some(&r1) if age_minutes >= r1 => due(MessageKind::Reminder1, Reminder1Sent),
            _ => ScanDecision::Leave,
        },
        Reminder1Sent => match schedule.reminders.get(1) {
            Some(&r2) if age_minutes >= r2 => due(MessageKind::Reminder2, Reminder2Sent),
            _ => ScanDecision::Leave,
        },
        SendError => {
            // Re-derive the gate for the failed class. A missing retry
            // target means the initial send failed before the field
            // existed; fall back to retrying the initial message.
            let target = retry_target.unwrap_or(NotificationSent);
            let kind = match target {
                Reminder1Sent => MessageKind::Reminder1,
                Reminder2Sent => MessageKind::Reminder2,
                _ => MessageKind::Initial,
            };
            due(kind, target)
        }
        _ => ScanDecision::Leave,
    }
}

/// Decide the scan action for one non-terminal instance.
pub fn next_decision(
    status: PromptStatus,
    retry_target: Option<PromptStatus>,
    age_minutes: i64,
    opted_out: bool,
    schedule: &Schedule,
) -> ScanDecision {
    if status.is_terminal() {
        return ScanDecision::Leave;
    }

    // Rule 1: expiry wins over everything, including pending sends.
    if age_minutes >= schedule.close_offset {
        let closed = if status == PromptStatus::Scheduled {
            PromptStatus::Missed
        } else {
            PromptStatus::WindowClosed
        };
        return ScanDecision::Expire(closed);
    }

    // Rule 2: opt-out pre-empts sends but not expiry.
    if opted_out {
        return ScanDecision::OptOut;
    }

    // Rule 3: send progression.
    pending_send(status, retry_target, age_minutes, schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use PromptStatus::*;

    fn schedule() -> Schedule {
        Schedule {
            name: "s".into(),
            offsets: vec![0, 240, 480, 720],
            randomize_window: 0,
            jitter_resolution: 1,
            reminders: vec![5, 10],
            close_offset: 20,
        }
    }

    #[test]
    fn test_open_time_arrived_sends_initial() {
        // 10 minutes old, close at 20: initial message goes out
        let decision = next_decision(Scheduled, None, 10, false, &schedule());
        assert_eq!(
            decision,
            ScanDecision::Send { kind: MessageKind::Initial, on_success: NotificationSent }
        );
    }

    #[test]
    fn test_not_yet_open_leaves() {
        assert_eq!(next_decision(Scheduled, None, -3, false, &schedule()), ScanDecision::Leave);
    }

    #[test]
    fn test_expiry_beats_reminder() {
        // 35 minutes old with close at 20: closes, no reminder sent
        let decision = next_decision(NotificationSent, None, 35, false, &schedule());
        assert_eq!(decision, ScanDecision::Expire(WindowClosed));
    }

    #[test]
    fn test_expiry_of_never_sent_is_missed() {
        assert_eq!(
            next_decision(Scheduled, None, 25, false, &schedule()),
            ScanDecision::Expire(Missed)
        );
    }

    #[test]
    fn test_expiry_beats_opt_out() {
        // Already expired instances are never resurrected to OptedOut
        assert_eq!(
            next_decision(NotificationSent, None, 30, true, &schedule()),
            ScanDecision::Expire(WindowClosed)
        );
    }

    #[test]
    fn test_opt_out_beats_send() {
        assert_eq!(next_decision(NotificationSent, None, 7, true, &schedule()), ScanDecision::OptOut);
    }

    #[test]
    fn test_reminder_gating() {
        let s = schedule();
        assert_eq!(next_decision(NotificationSent, None, 4, false, &s), ScanDecision::Leave);
        assert_eq!(
            next_decision(NotificationSent, None, 5, false, &s),
            ScanDecision::Send { kind: MessageKind::Reminder1, on_success: Reminder1Sent }
        );
        assert_eq!(next_decision(Reminder1Sent, None, 9, false, &s), ScanDecision::Leave);
        assert_eq!(
            next_decision(Reminder1Sent, None, 10, false, &s),
            ScanDecision::Send { kind: MessageKind::Reminder2, on_success: Reminder2Sent }
        );
    }

    #[test]
    fn test_no_second_reminder_configured() {
        let mut s = schedule();
        s.reminders = vec![5];
        assert_eq!(next_decision(Reminder1Sent, None, 15, false, &s), ScanDecision::Leave);
    }

    #[test]
    fn test_reminder2_sent_waits() {
        assert_eq!(next_decision(Reminder2Sent, None, 15, false, &schedule()), ScanDecision::Leave);
    }

    #[test]
    fn test_send_error_retries_same_class() {
        let decision = next_decision(SendError, Some(Reminder1Sent), 12, false, &schedule());
        assert_eq!(
            decision,
            ScanDecision::Send { kind: MessageKind::Reminder1, on_success: Reminder1Sent }
        );
    }

    #[test]
    fn test_send_error_expires_like_sent() {
        assert_eq!(
            next_decision(SendError, Some(NotificationSent), 25, false, &schedule()),
            ScanDecision::Expire(WindowClosed)
        );
    }

    #[test]
    fn test_terminal_left_alone() {
        assert_eq!(next_decision(Completed, None, 50, true, &schedule()), ScanDecision::Leave);
    }
}
