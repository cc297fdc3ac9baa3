//! Out-of-band server messages: notices and LISTEN/NOTIFY notifications.
//!
//! Neither is tied to a query. Notices arrive through a hook the session
//! calls while it parses input; notifications queue up inside the session
//! and are drained after every read.

use tracing::trace;

use crate::event::{Event, EventSink, Notice};
use crate::pg::session::{NoticeHandler, Session};

/// Build the hook that forwards session notices to `sink`.
///
/// The hook owns its own sender, so it lives exactly as long as the session
/// it is installed on.
pub(crate) fn notice_forwarder(sink: &EventSink) -> NoticeHandler {
    let sink = sink.clone();
    Box::new(move |message: &str| {
        trace!(message, "notice");
        sink.emit(Event::Notice(Notice(message.to_string())));
    })
}

/// Emit every pending notification, oldest first. Returns how many were emitted.
pub(crate) fn drain_notifications<S: Session>(session: &mut S, sink: &EventSink) -> usize {
    let mut count = 0;
    while let Some(notification) = session.next_notification() {
        trace!(channel = %notification.channel, "notification");
        sink.emit(Event::Notification(notification));
        count += 1;
    }
    count
}
