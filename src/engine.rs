//! The sync engine: bridges the X11 adapter and the peer stream, enforcing
//! echo-guard ordering, and drives a single `tokio::select!` cooperative
//! loop over X readiness and peer socket readiness. No coalescing or rate
//! limiting — the echo-guard is the only defense against repetition.

use std::time::Duration;

use anyhow::Context;
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::fingerprint::{fingerprint, EchoGuard};
use crate::frame::{self, FrameError, FrameReader};
use crate::lifecycle::Shutdown;
use crate::x11::{Selection, XAdapter, XEvent};

/// Bounded wait for a foreign selection owner to answer a conversion
/// request.
const READ_TEXT_DEADLINE: Duration = Duration::from_secs(2);

/// Internal to [`Session::dispatch_x_event`]: lets the caller tell a peer
/// write failure apart from an X-side failure without collapsing both
/// into one error type.
enum DispatchError {
    PeerIo(std::io::Error),
    X(anyhow::Error),
}

/// Why [`Session::run`] stopped.
pub enum EngineExit {
    /// Peer closed the connection cleanly — no partial frame pending.
    PeerClosed,
    /// A cooperative shutdown was requested.
    ShutdownRequested,
    /// The peer sent a malformed/oversized/truncated frame.
    Frame(FrameError),
    /// The peer socket itself failed.
    PeerIo(std::io::Error),
    /// The X connection died outright (distinct from the per-call
    /// failures this engine otherwise recovers from locally).
    Fatal(anyhow::Error),
}

/// Per-connection session state: the X adapter and the echo-guard. Created
/// per accepted/connected peer, dropped on exit.
pub struct Session {
    x: XAdapter,
    guard: EchoGuard,
}

impl Session {
    pub fn new(x: XAdapter) -> Self {
        Self { x, guard: EchoGuard::new() }
    }

    /// Resets both echo-guard slots. The client transport shell calls this
    /// before every connection attempt, so content already synced before a
    /// disconnect is reconsidered fresh after reconnecting.
    pub fn reset_echo_guard(&mut self) {
        self.guard.clear();
    }

    /// Runs until the peer channel closes, a frame/IO error occurs, or
    /// `shutdown` is notified.
    pub async fn run(&mut self, mut peer: UnixStream, shutdown: &Shutdown) -> EngineExit {
        let mut reader = FrameReader::new();

        loop {
            if let Err(exit) = self.drain_and_dispatch(&mut peer).await {
                return exit;
            }

            tokio::select! {
                biased;

                _ = shutdown.wait() => {
                    return EngineExit::ShutdownRequested;
                }

                readable = self.x.wait_readable() => {
                    if let Err(e) = readable {
                        return EngineExit::Fatal(anyhow::Error::new(e).context("X connection fd"));
                    }
                    // Next loop iteration's eager drain picks up whatever
                    // this readiness edge queued.
                }

                frame = reader.next_frame(&mut peer) => {
                    match frame {
                        Ok(payload) => self.handle_inbound(payload),
                        Err(FrameError::Eof) => return EngineExit::PeerClosed,
                        Err(FrameError::Io(e)) => return EngineExit::PeerIo(e),
                        Err(other) => return EngineExit::Frame(other),
                    }
                }
            }
        }
    }

    /// Drains and dispatches every X event already queued, looping until
    /// none are left. Called at the top of every iteration of the loop in
    /// [`Self::run`], not only after `wait_readable` resolves — `AsyncFd`
    /// is edge-triggered, and x11rb buffers any event it encounters while
    /// a synchronous call like `get_property().reply()` or
    /// `set_selection_owner(..).check()` drains the socket to
    /// `WouldBlock`. Those buffered events would otherwise sit unseen
    /// until unrelated X traffic produced a fresh readiness edge.
    async fn drain_and_dispatch(&mut self, peer: &mut UnixStream) -> Result<(), EngineExit> {
        loop {
            let events = self
                .x
                .drain_pending()
                .map_err(|e| EngineExit::Fatal(e.context("draining X events")))?;
            if events.is_empty() {
                return Ok(());
            }
            for event in events {
                if let Err(e) = self.dispatch_x_event(peer, event).await {
                    return Err(match e {
                        DispatchError::PeerIo(e) => EngineExit::PeerIo(e),
                        DispatchError::X(e) => EngineExit::Fatal(e),
                    });
                }
            }
        }
    }

    async fn dispatch_x_event(
        &mut self,
        peer: &mut UnixStream,
        event: XEvent,
    ) -> Result<(), DispatchError> {
        match event {
            XEvent::OwnershipChanged { selection, owner_is_self } => {
                if owner_is_self {
                    return Ok(());
                }
                self.handle_outbound(peer, selection).await
            }
            XEvent::Request(req) => {
                if let Err(e) = self.x.answer(req) {
                    warn!("answer(SelectionRequest) failed: {e:#}");
                }
                Ok(())
            }
        }
    }

    /// A local selection changed owner to something other than us: fetch
    /// its text and forward it to the peer unless the echo-guard
    /// suppresses it. A failure writing to the peer is reported distinctly
    /// from an X failure, so the caller can tell a dead peer connection
    /// (worth reconnecting over) from a dead X server (fatal).
    async fn handle_outbound(
        &mut self,
        peer: &mut UnixStream,
        selection: Selection,
    ) -> Result<(), DispatchError> {
        let payload = match self.x.read_text(selection, READ_TEXT_DEADLINE).await {
            Some(p) => p,
            None => {
                debug!("outbound: read_text({:?}) returned no usable text", selection);
                return Ok(());
            }
        };
        if payload.len() > frame::MAX_PAYLOAD_BYTES {
            warn!(
                "outbound: {:?} payload of {} bytes exceeds 10 MiB, dropping",
                selection,
                payload.len()
            );
            return Ok(());
        }
        let fp = fingerprint(&payload);
        if !self.guard.should_send(&fp) {
            debug!("outbound: suppressing echo/duplicate for {:?}", selection);
            return Ok(());
        }
        let framed =
            frame::encode(&payload).map_err(|e| DispatchError::X(anyhow::anyhow!("{e}")))?;
        peer.write_all(&framed).await.map_err(DispatchError::PeerIo)?;
        peer.flush().await.map_err(DispatchError::PeerIo)?;
        // Only mark it sent once the flush above has actually succeeded.
        self.guard.record_sent(fp);
        Ok(())
    }

    /// A full frame arrived from the peer: record it as received before
    /// touching any selection, so the ownership-change event that
    /// `set_text` produces is recognized as our own echo and not
    /// forwarded back out.
    fn handle_inbound(&mut self, payload: Vec<u8>) {
        let fp = fingerprint(&payload);
        self.guard.record_received(fp);
        if !self.x.set_text(Selection::Clipboard, &payload) {
            warn!("inbound: set_text(Clipboard) failed");
        }
        if !self.x.set_text(Selection::Primary, &payload) {
            warn!("inbound: set_text(Primary) failed");
        }
    }
}
