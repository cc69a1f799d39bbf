// Copyright 2022. The Agora Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    future::{FusedFuture, Shared},
    FutureExt,
};
use tokio::sync::oneshot;

type SignalFuture = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

/// Trigger for shutdowns.
///
/// Use `to_signal` to create a future which will resolve when `Shutdown` is triggered.
/// Use `trigger` to signal. All signals will resolve.
///
/// _Note_: This will trigger when dropped, so the `Shutdown` instance should be held as
/// long as required by the application.
#[derive(Debug)]
pub struct Shutdown {
    trigger: Option<oneshot::Sender<()>>,
    signal: ShutdownSignal,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        // Either an explicit trigger (Ok) or the sender dropping (Err) resolves the signal
        let fut: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            let _ = rx.await;
        });
        Self {
            trigger: Some(tx),
            signal: ShutdownSignal { inner: fut.shared() },
        }
    }

    /// Trigger all linked signals. Idempotent.
    pub fn trigger(&mut self) {
        if let Some(tx) = self.trigger.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.trigger.is_none()
    }

    pub fn to_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver end of a shutdown signal. Once resolved the consumer should shut down.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: SignalFuture,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        self.inner.peek().is_some()
    }

    /// Wait for the shutdown signal to trigger.
    pub async fn wait(&mut self) {
        self.inner.clone().await;
    }
}

impl Future for ShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl FusedFuture for ShutdownSignal {
    fn is_terminated(&self) -> bool {
        self.inner.peek().is_some()
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("is_triggered", &self.is_triggered())
            .finish()
    }
}

/// A shutdown signal that may not be wired up yet. Pending forever while unset.
#[derive(Debug, Clone, Default)]
pub struct OptionalShutdownSignal(Option<ShutdownSignal>);

impl OptionalShutdownSignal {
    pub fn none() -> Self {
        Self(None)
    }

    /// Set the shutdown signal. Once set this OptionalShutdownSignal will resolve
    /// in the same way as the given `ShutdownSignal`.
    pub fn set(&mut self, signal: ShutdownSignal) -> &mut Self {
        self.0 = Some(signal);
        self
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    pub fn into_signal(self) -> Option<ShutdownSignal> {
        self.0
    }

    pub fn take(&mut self) -> Option<ShutdownSignal> {
        self.0.take()
    }
}

impl Future for OptionalShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.0.as_mut() {
            Some(inner) => Pin::new(inner).poll(cx),
            None => Poll::Pending,
        }
    }
}

impl From<ShutdownSignal> for OptionalShutdownSignal {
    fn from(inner: ShutdownSignal) -> Self {
        Self(Some(inner))
    }
}
