use tokio::sync::mpsc;

/// Process exit code after a second ctrl-c.
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    /// Finish running tasks, lease nothing new, flush uploads.
    Graceful,
    /// Exit now; leased messages reappear after their lease.
    Immediate,
}

fn request_for_press(presses: u32) -> StopRequest {
    if presses <= 1 {
        StopRequest::Graceful
    } else {
        StopRequest::Immediate
    }
}

/// Forward ctrl-c presses as stop requests until an immediate one is sent.
pub fn spawn_ctrl_c_listener() -> mpsc::UnboundedReceiver<StopRequest> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut presses = 0u32;
        while tokio::signal::ctrl_c().await.is_ok() {
            presses += 1;
            let request = request_for_press(presses);
            if tx.send(request).is_err() || request == StopRequest::Immediate {
                return;
            }
        }
    });
    rx
}
