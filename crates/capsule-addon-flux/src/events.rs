//! Publishes failed passes as Kubernetes Events on the ServiceAccount, so they show up in
//! `kubectl describe`.
use std::error::Error as _;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::{
    controller,
    events::{Event, EventType, Recorder, Reporter},
    watcher,
};
use tracing::Instrument;

use crate::{constants::MANAGER_NAME, reconciler};

/// The API server rejects longer notes.
const MAX_NOTE_LEN: usize = 1024;
const ELLIPSIS: char = '…';

pub fn recorder(client: kube::Client) -> Recorder {
    Recorder::new(client, Reporter {
        controller: MANAGER_NAME.to_owned(),
        instance: None,
    })
}

/// Turns a failed pass into a Warning Event, with the full error chain as note.
pub fn error_to_event(error: &reconciler::Error) -> Event {
    let mut note = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        note.push_str(": ");
        note.push_str(&cause.to_string());
        source = cause.source();
    }
    truncate_with_ellipsis(&mut note, MAX_NOTE_LEN);

    Event {
        type_: EventType::Warning,
        reason: error.category().to_owned(),
        note: Some(note),
        action: "Reconcile".to_owned(),
        secondary: None,
    }
}

/// Publishes `controller_error` in the background if it belongs to a ServiceAccount.
///
/// Queue and runner errors aren't tied to an object and are only logged, as are cancelled passes.
pub fn publish_controller_error(
    recorder: &Recorder,
    controller_error: &controller::Error<reconciler::Error, watcher::Error>,
) {
    let controller::Error::ReconcilerFailed(error, object) = controller_error else {
        return;
    };
    // Passes are only cancelled on shutdown, that says nothing about the ServiceAccount.
    if matches!(error, reconciler::Error::Cancelled) {
        return;
    }
    let reference: ObjectReference = object.clone().into();
    let event = error_to_event(error);
    let recorder = recorder.clone();

    tokio::spawn(
        async move {
            if let Err(error) = recorder.publish(&event, &reference).await {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to publish reconcile error as Event"
                );
            }
        }
        .in_current_span(),
    );
}

/// Cuts `message` down to at most `max_len` bytes, marking the cut with an ellipsis.
fn truncate_with_ellipsis(message: &mut String, max_len: usize) {
    if message.len() <= max_len {
        return;
    }

    let mut end = max_len.saturating_sub(ELLIPSIS.len_utf8());
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
    if ELLIPSIS.len_utf8() <= max_len {
        message.push(ELLIPSIS);
    }
}
