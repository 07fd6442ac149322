use std::sync::Arc;

use bytes::Bytes;

/// Outbound half of a link.
///
/// Implementations must be safe to call from any thread; the App layer sends
/// requests from caller threads and responses from its worker thread.
pub trait Transport: Send + Sync {
    /// Hand one complete App-layer datagram to the link.
    ///
    /// Returns `false` when the link cannot accept the datagram (link down,
    /// queue full, peer gone). The datagram is not retained in that case.
    fn send_frame(&self, frame: Bytes) -> bool;
}

/// Inbound half of a link: the events a transport reports upward.
pub trait LinkHandler: Send + Sync {
    /// A complete datagram arrived from the peer.
    fn on_frame_received(&self, frame: Bytes);

    /// The link was reset; every in-flight exchange is gone.
    fn on_reset_detected(&self);

    /// The link (re-)established and is ready to carry datagrams.
    fn on_link_established(&self);
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send_frame(&self, frame: Bytes) -> bool {
        (**self).send_frame(frame)
    }
}

impl<T: LinkHandler + ?Sized> LinkHandler for Arc<T> {
    fn on_frame_received(&self, frame: Bytes) {
        (**self).on_frame_received(frame)
    }

    fn on_reset_detected(&self) {
        (**self).on_reset_detected()
    }

    fn on_link_established(&self) {
        (**self).on_link_established()
    }
}
