//! The X11 selection adapter: owns the display connection and a 1x1
//! unmapped owner window, watches ownership changes via XFixes, fetches
//! foreign-owned selection content under a bounded deadline, and answers
//! conversion requests for the content we currently own.
//!
//! XFixes subscription and the `convert_selection` + `SelectionNotify`
//! round trip are driven directly off `AsyncFd` readiness rather than a
//! dedicated blocking thread, so the whole engine stays on one event loop.

use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use anyhow::Context;
use log::{debug, warn};
use tokio::io::unix::AsyncFd;

use x11rb::connection::Connection;
use x11rb::protocol::xfixes::{self, SelectionEventMask};
use x11rb::protocol::xproto::{
    self, Atom, AtomEnum, ConnectionExt, CreateWindowAux, EventMask, PropMode,
    SelectionNotifyEvent, SelectionRequestEvent, Window, WindowClass,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;
use x11rb::{COPY_FROM_PARENT, CURRENT_TIME};

/// Name of the property we ask foreign owners to stash conversion replies
/// in, and that we use as the destination for our own `GetProperty` calls.
const TRANSFER_PROPERTY: &str = "PCLIPSYNC_TRANSFER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selection {
    Clipboard,
    Primary,
}

impl Selection {
    fn atom_name(self) -> &'static str {
        match self {
            Selection::Clipboard => "CLIPBOARD",
            Selection::Primary => "PRIMARY",
        }
    }

    const ALL: [Selection; 2] = [Selection::Clipboard, Selection::Primary];
}

/// A pending `SelectionRequest` we must answer.
pub struct PendingRequest {
    inner: SelectionRequestEvent,
}

/// One decoded X event of interest, as delivered by [`XAdapter::drain_pending`].
pub enum XEvent {
    /// Some client (possibly us) became the owner of `selection`.
    OwnershipChanged { selection: Selection, owner_is_self: bool },
    /// Someone wants `selection` converted to a target.
    Request(PendingRequest),
}

struct Atoms {
    clipboard: Atom,
    primary: Atom,
    utf8_string: Atom,
    string: Atom,
    targets: Atom,
    incr: Atom,
    transfer: Atom,
}

impl Atoms {
    fn intern<C: Connection>(conn: &C) -> anyhow::Result<Self> {
        Ok(Self {
            clipboard: intern(conn, "CLIPBOARD")?,
            primary: intern(conn, "PRIMARY")?,
            utf8_string: intern(conn, "UTF8_STRING")?,
            string: AtomEnum::STRING.into(),
            targets: intern(conn, "TARGETS")?,
            incr: intern(conn, "INCR")?,
            transfer: intern(conn, TRANSFER_PROPERTY)?,
        })
    }

    fn of(&self, selection: Selection) -> Atom {
        match selection {
            Selection::Clipboard => self.clipboard,
            Selection::Primary => self.primary,
        }
    }

    fn selection_of(&self, atom: Atom) -> Option<Selection> {
        if atom == self.clipboard {
            Some(Selection::Clipboard)
        } else if atom == self.primary {
            Some(Selection::Primary)
        } else {
            None
        }
    }
}

fn intern<C: Connection>(conn: &C, name: &str) -> anyhow::Result<Atom> {
    Ok(conn
        .intern_atom(false, name.as_bytes())
        .context("intern_atom")?
        .reply()
        .context("intern_atom reply")?
        .atom)
}

/// Newtype so a borrowed X11 connection fd can be wrapped in [`AsyncFd`].
struct BorrowedXFd(RawFd);

impl AsRawFd for BorrowedXFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

pub struct XAdapter {
    conn: RustConnection,
    win: Window,
    atoms: Atoms,
    async_fd: AsyncFd<BorrowedXFd>,
    owns: [bool; 2],
    cached_outgoing: Vec<u8>,
    /// Events observed and classified while a caller other than
    /// `drain_pending` was polling the connection directly — most notably
    /// `wait_for_conversion_reply`, which has to keep polling past events
    /// that aren't the reply it's waiting for. Flushed out on the next
    /// `drain_pending` call instead of being dropped.
    pending: Vec<XEvent>,
}

fn idx(selection: Selection) -> usize {
    match selection {
        Selection::Clipboard => 0,
        Selection::Primary => 1,
    }
}

impl XAdapter {
    /// Opens the display named by `$DISPLAY`, creates the 1x1 unmapped
    /// owner window, and subscribes to ownership notifications for both
    /// CLIPBOARD and PRIMARY.
    pub fn open() -> anyhow::Result<Self> {
        let (conn, screen_num) = RustConnection::connect(None).context(
            "failed to connect to the X server (is $DISPLAY set and reachable?)",
        )?;
        let screen = &conn.setup().roots[screen_num];

        xfixes::query_version(&conn, 5, 0)
            .context("xfixes query_version")?
            .reply()
            .context("xfixes query_version reply (XFixes extension required)")?;

        let win: Window = conn.generate_id().context("generate window id")?;
        conn.create_window(
            0,
            win,
            screen.root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_OUTPUT,
            COPY_FROM_PARENT,
            &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )
        .context("create owner window")?;
        conn.flush().ok();

        let atoms = Atoms::intern(&conn)?;

        for selection in Selection::ALL {
            xfixes::select_selection_input(
                &conn,
                win,
                atoms.of(selection),
                SelectionEventMask::SET_SELECTION_OWNER,
            )
            .with_context(|| format!("subscribe to {}", selection.atom_name()))?;
        }
        conn.flush().ok();

        let raw_fd = conn.stream().as_fd().as_raw_fd();
        let async_fd = AsyncFd::new(BorrowedXFd(raw_fd)).context("register X fd with runtime")?;

        Ok(Self {
            conn,
            win,
            atoms,
            async_fd,
            owns: [false, false],
            cached_outgoing: Vec::new(),
            pending: Vec::new(),
        })
    }

    fn owns(&self, selection: Selection) -> bool {
        self.owns[idx(selection)]
    }

    /// Waits for the X connection's fd to become readable. Callers should
    /// follow up with [`Self::drain_pending`] to consume what's queued.
    pub async fn wait_readable(&self) -> std::io::Result<()> {
        let mut guard = self.async_fd.readable().await?;
        guard.clear_ready();
        Ok(())
    }

    /// Classifies one event into an [`XEvent`] of interest, applying any
    /// `owns[]` update along the way. Shared by `drain_pending` and
    /// `wait_for_conversion_reply` so ownership bookkeeping and event
    /// surfacing never drift apart — an event handled by one must be
    /// handled the same way by the other.
    fn classify(&mut self, ev: Event) -> Option<XEvent> {
        match ev {
            Event::XfixesSelectionNotify(n) => {
                let selection = self.atoms.selection_of(n.selection)?;
                let owner_is_self = n.owner == self.win;
                self.owns[idx(selection)] = owner_is_self;
                Some(XEvent::OwnershipChanged { selection, owner_is_self })
            }
            Event::SelectionRequest(req) => Some(XEvent::Request(PendingRequest { inner: req })),
            Event::SelectionClear(clear) => {
                let selection = self.atoms.selection_of(clear.selection)?;
                self.owns[idx(selection)] = false;
                Some(XEvent::OwnershipChanged { selection, owner_is_self: false })
            }
            _ => None,
        }
    }

    /// Drains every event already queued on the connection without
    /// blocking, plus anything buffered by `wait_for_conversion_reply`
    /// since the last call. A single readiness wakeup can enqueue several
    /// events, and a synchronous `.reply()`/`cookie.check()` call
    /// elsewhere can cause x11rb to buffer unrelated events internally
    /// without a corresponding fd-readiness edge — callers must not rely
    /// on `wait_readable` alone to know when to call this.
    pub fn drain_pending(&mut self) -> anyhow::Result<Vec<XEvent>> {
        let mut out = std::mem::take(&mut self.pending);
        while let Some(ev) = self.conn.poll_for_event().context("poll_for_event")? {
            if let Some(xev) = self.classify(ev) {
                out.push(xev);
            }
        }
        Ok(out)
    }

    /// Returns `None` (never an error) on timeout, a
    /// missing property, an empty result, a non-text reply, or INCR.
    pub async fn read_text(&mut self, selection: Selection, deadline: Duration) -> Option<Vec<u8>> {
        if self.owns(selection) {
            return Some(self.cached_outgoing.clone());
        }

        if let Err(e) = self.request_conversion(selection) {
            debug!("read_text: convert_selection failed: {e:#}");
            return None;
        }

        match tokio::time::timeout(deadline, self.wait_for_conversion_reply(selection)).await {
            Ok(Ok(Some(bytes))) => Some(bytes),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                debug!("read_text: {e:#}");
                None
            }
            Err(_) => {
                debug!("read_text: timed out waiting for SelectionNotify on {:?}", selection);
                None
            }
        }
    }

    fn request_conversion(&self, selection: Selection) -> anyhow::Result<()> {
        self.conn
            .convert_selection(
                self.win,
                self.atoms.of(selection),
                self.atoms.utf8_string,
                self.atoms.transfer,
                CURRENT_TIME,
            )
            .context("convert_selection")?;
        self.conn.flush().ok();
        Ok(())
    }

    /// Polls for the matching `SelectionNotify` reply, yielding between
    /// attempts. Bounded by the caller's `tokio::time::timeout`.
    ///
    /// Anything else seen in the meantime is not discarded: a
    /// `SelectionRequest` is answered inline (deferring it would make a
    /// local paste of the selection we currently own wait behind our own
    /// outbound fetch, possibly past its own timeout), and everything
    /// else — ownership changes on the other selection included — is
    /// buffered for the next `drain_pending` call.
    async fn wait_for_conversion_reply(
        &mut self,
        selection: Selection,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let target_selection = self.atoms.of(selection);
        loop {
            while let Some(ev) = self.conn.poll_for_event().context("poll_for_event")? {
                match ev {
                    Event::SelectionNotify(n)
                        if n.selection == target_selection && n.target == self.atoms.utf8_string =>
                    {
                        return Ok(self.collect_conversion_reply(n)?);
                    }
                    Event::SelectionRequest(req) => {
                        let pending = PendingRequest { inner: req };
                        if let Err(e) = self.answer(pending) {
                            warn!("answer(SelectionRequest) during conversion wait failed: {e:#}");
                        }
                    }
                    other => {
                        if let Some(xev) = self.classify(other) {
                            self.pending.push(xev);
                        }
                    }
                }
            }
            self.wait_readable().await.context("wait for X readiness")?;
        }
    }

    fn collect_conversion_reply(
        &self,
        notify: SelectionNotifyEvent,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        if notify.property == u32::from(AtomEnum::NONE) {
            return Ok(None);
        }
        let reply = self
            .conn
            .get_property(false, self.win, notify.property, AtomEnum::ANY, 0, u32::MAX)
            .context("get_property")?
            .reply()
            .context("get_property reply")?;
        let _ = self.conn.delete_property(self.win, notify.property);
        self.conn.flush().ok();

        if reply.type_ == self.atoms.incr {
            // Chunked INCR transfers are not supported.
            return Ok(None);
        }
        if reply.type_ != self.atoms.utf8_string {
            return Ok(None);
        }
        if reply.value.is_empty() {
            return Ok(None);
        }
        Ok(Some(reply.value))
    }

    /// Asserts ownership of `selection` and caches
    /// `payload` as the content served to future conversion requests.
    /// Returns `false` on any X error; never fatal.
    pub fn set_text(&mut self, selection: Selection, payload: &[u8]) -> bool {
        let result: anyhow::Result<()> = (|| {
            let cookie = self
                .conn
                .set_selection_owner(self.win, self.atoms.of(selection), CURRENT_TIME)?;
            cookie.check()?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                self.conn.flush().ok();
                self.owns[idx(selection)] = true;
                self.cached_outgoing = payload.to_vec();
                true
            }
            Err(e) => {
                debug!("set_text({:?}) failed: {e}", selection);
                false
            }
        }
    }

    /// Responds to one `SelectionRequest`.
    pub fn answer(&self, request: PendingRequest) -> anyhow::Result<()> {
        let req = request.inner;
        let mut property = req.property;
        if property == u32::from(AtomEnum::NONE) {
            // ICCCM fallback when the requestor left property unset.
            property = req.target;
        }

        if req.target == self.atoms.targets {
            let mut atoms = vec![self.atoms.targets, self.atoms.utf8_string, self.atoms.string];
            atoms.sort_unstable();
            atoms.dedup();
            let bytes: Vec<u8> = atoms.iter().flat_map(|a| a.to_ne_bytes()).collect();
            self.conn
                .change_property(
                    PropMode::REPLACE,
                    req.requestor,
                    property,
                    AtomEnum::ATOM,
                    32,
                    atoms.len() as u32,
                    &bytes,
                )
                .context("change_property TARGETS")?;
            return self.notify(req, property);
        }

        if req.target == self.atoms.utf8_string || req.target == self.atoms.string {
            self.conn
                .change_property(
                    PropMode::REPLACE,
                    req.requestor,
                    property,
                    req.target,
                    8,
                    self.cached_outgoing.len() as u32,
                    &self.cached_outgoing,
                )
                .context("change_property text")?;
            return self.notify(req, property);
        }

        // Unsupported target: refuse.
        self.notify(req, u32::from(AtomEnum::NONE))
    }

    fn notify(&self, req: SelectionRequestEvent, property: Atom) -> anyhow::Result<()> {
        let ev = SelectionNotifyEvent {
            response_type: xproto::SELECTION_NOTIFY_EVENT,
            sequence: 0,
            time: req.time,
            requestor: req.requestor,
            selection: req.selection,
            target: req.target,
            property,
        };
        self.conn
            .send_event(false, req.requestor, EventMask::NO_EVENT, ev)
            .context("send_event SelectionNotify")?;
        self.conn.flush().ok();
        Ok(())
    }
}
