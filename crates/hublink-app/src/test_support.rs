use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use hublink_transport::Transport;

use crate::header::AppMessage;

/// Records every datagram instead of delivering it.
#[derive(Default)]
pub(crate) struct CapturingTransport {
    pub(crate) sent: Mutex<Vec<AppMessage>>,
    pub(crate) refuse: AtomicBool,
}

impl CapturingTransport {
    pub(crate) fn sent(&self) -> Vec<AppMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn take(&self) -> Vec<AppMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl Transport for CapturingTransport {
    fn send_frame(&self, frame: Bytes) -> bool {
        if self.refuse.load(Ordering::SeqCst) {
            return false;
        }
        self.sent
            .lock()
            .unwrap()
            .push(AppMessage::decode(&frame).unwrap());
        true
    }
}
