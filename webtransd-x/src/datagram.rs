//! Send receipts for QUIC datagrams.
//!
//! The transport echoes each datagram's sequence number back in a
//! `DatagramAcked` or `DatagramLost` event; the receipt turns that into a
//! pair of one-shot futures for the caller.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

pub(crate) struct ReceiptSenders {
    pub(crate) acked: oneshot::Sender<()>,
    pub(crate) lost: oneshot::Sender<()>,
}

impl ReceiptSenders {
    pub(crate) fn resolve_acked(self) {
        let _ = self.acked.send(());
    }

    pub(crate) fn resolve_lost(self) {
        let _ = self.lost.send(());
    }
}

/// Receipt for a sent datagram.
///
/// At most one of the two signals fires; the other pends forever. Both pend
/// forever if the connection goes away before the transport reports back.
pub struct DatagramSend {
    /// Resolves when the datagram was acknowledged by the peer.
    pub acknowledged: DatagramSignal,
    /// Resolves when the datagram is considered lost.
    pub lost: DatagramSignal,
}

impl DatagramSend {
    pub(crate) fn new(acked: oneshot::Receiver<()>, lost: oneshot::Receiver<()>) -> Self {
        DatagramSend {
            acknowledged: DatagramSignal { rx: acked },
            lost: DatagramSignal { rx: lost },
        }
    }
}

/// One-shot outcome signal; never resolves if its outcome did not occur.
pub struct DatagramSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for DatagramSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(()),
            // Sender dropped: the other outcome happened (or the connection
            // died); this signal can never fire.
            Poll::Ready(Err(_)) => Poll::Pending,
            Poll::Pending => Poll::Pending,
        }
    }
}
