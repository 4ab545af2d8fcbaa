use tokio::{
    signal::unix::{SignalKind, signal},
    sync::broadcast,
};

/// Receiving side of a shutdown request. Every clone is notified.
pub struct ShutdownSignal {
    tx: broadcast::Sender<()>,
    rx: broadcast::Receiver<()>,
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn new() -> (ShutdownSender, ShutdownSignal) {
        let (tx, rx) = broadcast::channel(1);
        (ShutdownSender(tx.clone()), ShutdownSignal { tx, rx })
    }

    /// Wait until shutdown is requested.
    pub async fn recv(&mut self) {
        let _ = self.rx.recv().await;
    }
}

pub struct ShutdownSender(broadcast::Sender<()>);

impl ShutdownSender {
    pub fn send_signal(self) {
        let _ = self.0.send(());
    }
}

/// Request shutdown on SIGINT, SIGTERM or SIGQUIT.
///
/// Must be called from inside a tokio runtime.
pub fn on_termination_signals() -> std::io::Result<ShutdownSignal> {
    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_quit = signal(SignalKind::quit())?;

    let (tx_shutdown, shutdown) = ShutdownSignal::new();
    tokio::spawn(async move {
        tokio::select! {
            _ = sig_int.recv() => log::trace!("SIGINT received"),
            _ = sig_term.recv() => log::trace!("SIGTERM received"),
            _ = sig_quit.recv() => log::trace!("SIGQUIT received"),
        }
        tx_shutdown.send_signal();
    });
    Ok(shutdown)
}
