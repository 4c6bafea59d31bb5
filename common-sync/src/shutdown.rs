//! Watch-channel shutdown signal shared by every long-running task.
//!
//! Holders of a receiver park on [`wait`]; triggering the sender releases
//! all of them at once. Receivers cloned after the trigger still observe it.

use tokio::sync::watch;

pub type ShutdownSender = watch::Sender<bool>;
pub type ShutdownReceiver = watch::Receiver<bool>;

pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    watch::channel(false)
}

pub fn trigger(sender: &ShutdownSender) {
    let _ = sender.send(true);
}

pub async fn wait(mut receiver: ShutdownReceiver) {
    if *receiver.borrow() {
        return;
    }

    while receiver.changed().await.is_ok() {
        if *receiver.borrow() {
            break;
        }
    }
}
