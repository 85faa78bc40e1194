//! Operation result notifications.
//!
//! Connections report publish, subscribe, unsubscribe, network and persist
//! outcomes onto a channel; a single fan-out task per client turns them
//! into callback invocations, so a slow or panicking callback never runs
//! on a connection task.

use tokio::sync::mpsc;

use crate::error::ClientError;

#[derive(Debug)]
pub(crate) enum Notification {
    /// A publish finished (QoS 0 write, PUBACK or PUBCOMP) or failed.
    Pub {
        topic: String,
        err: Option<ClientError>,
    },
    /// A SUBACK arrived; `result` pairs each filter with its granted QoS
    /// code (0..=2) or the 0x80 failure marker.
    Sub {
        result: Vec<(String, u8)>,
        err: Option<ClientError>,
    },
    /// An UNSUBACK arrived.
    Unsub {
        filters: Vec<String>,
        err: Option<ClientError>,
    },
    /// Transport-level event on a named server connection.
    Net { server: String, err: ClientError },
    /// A persistence operation failed.
    Persist { err: ClientError },
}

pub(crate) fn notify_pub(tx: &mpsc::Sender<Notification>, topic: String, err: Option<ClientError>) {
    let _ = tx.try_send(Notification::Pub { topic, err });
}

pub(crate) fn notify_sub(
    tx: &mpsc::Sender<Notification>,
    result: Vec<(String, u8)>,
    err: Option<ClientError>,
) {
    let _ = tx.try_send(Notification::Sub { result, err });
}

pub(crate) fn notify_unsub(
    tx: &mpsc::Sender<Notification>,
    filters: Vec<String>,
    err: Option<ClientError>,
) {
    let _ = tx.try_send(Notification::Unsub { filters, err });
}

pub(crate) fn notify_net(tx: &mpsc::Sender<Notification>, server: String, err: ClientError) {
    let _ = tx.try_send(Notification::Net { server, err });
}

/// Persist results are only reported when they fail.
pub(crate) fn notify_persist(tx: &mpsc::Sender<Notification>, result: Result<(), ClientError>) {
    if let Err(err) = result {
        let _ = tx.try_send(Notification::Persist { err });
    }
}
