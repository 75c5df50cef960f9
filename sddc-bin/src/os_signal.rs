use tokio_util::sync::CancellationToken;

static CANCEL: tokio::sync::OnceCell<CancellationToken> = tokio::sync::OnceCell::const_new();

/// Program-wide quit flag, raised by OS signals or by any task that decides
/// the run is over.
pub struct Quit(CancellationToken);

impl Quit {
    /// Returns when the program has been asked to quit.
    pub async fn quit(&self) {
        self.0.cancelled().await
    }

    /// Ask every task to wind down.
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub async fn run_until_cancelled<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        self.0.run_until_cancelled(fut).await
    }
}

#[cfg(unix)]
fn watch_signals(cancel: &CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    for kind in [
        SignalKind::interrupt(),
        SignalKind::hangup(),
        SignalKind::terminate(),
        SignalKind::pipe(),
        SignalKind::quit(),
    ] {
        let mut sig = match signal(kind) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!("Can't watch signal {kind:?}: {e}");
                continue;
            }
        };
        let cancel_tx = cancel.clone();
        tokio::spawn(async move {
            sig.recv().await;
            cancel_tx.cancel();
        });
    }
}

#[cfg(windows)]
fn watch_signals(cancel: &CancellationToken) {
    use tokio::signal::windows;

    macro_rules! watch {
        ($ctor:path) => {
            match $ctor() {
                Ok(mut sig) => {
                    let cancel_tx = cancel.clone();
                    tokio::spawn(async move {
                        sig.recv().await;
                        cancel_tx.cancel();
                    });
                }
                Err(e) => tracing::warn!("Can't watch {}: {e}", stringify!($ctor)),
            }
        };
    }
    watch!(windows::ctrl_c);
    watch!(windows::ctrl_break);
    watch!(windows::ctrl_close);
    watch!(windows::ctrl_logoff);
    watch!(windows::ctrl_shutdown);
}

pub async fn quit_watch() -> Quit {
    let cancel = CANCEL
        .get_or_init(|| async move {
            let cancel = CancellationToken::new();
            watch_signals(&cancel);
            cancel
        })
        .await;
    Quit(cancel.clone())
}
