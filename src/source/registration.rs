use std::time::Duration;

use crate::{
    cancel::{CancelCause, CancelRegistration, CancellationToken},
    reactor::{Reactor, TimerHandle},
};

/// The timeout timer and cancellation callback of one generation.
///
/// Both are disarmed together when the registration is dropped or
/// [disarmed](Registration::disarm).
#[derive(Default)]
pub(crate) struct Registration {
    timer: Option<TimerHandle>,
    cancel: Option<CancelRegistration>,
}

impl Registration {
    /// Schedule `on_timeout` after `timeout` (if any) and register
    /// `on_cancel` with `token` (if any).
    ///
    /// If `token` is already canceled, `on_cancel` runs before this returns.
    pub fn arm(
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
        on_timeout: impl FnOnce(Duration) + Send + 'static,
        on_cancel: impl FnOnce(CancelCause) + Send + 'static,
    ) -> Self {
        let timer = timeout.map(|after| Reactor::schedule(after, move || on_timeout(after)));
        let cancel = token.map(|token| token.register(on_cancel));

        Self { timer, cancel }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.timer.is_none() && self.cancel.is_none()
    }

    pub fn disarm(self) {
        if let Some(timer) = self.timer {
            timer.disarm();
        }

        if let Some(cancel) = self.cancel {
            cancel.disarm();
        }
    }
}
