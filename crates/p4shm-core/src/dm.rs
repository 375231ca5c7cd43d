//! The data-movement thread
//!
//! One per process. It owns the consumer side of the rank's receive and ack
//! queues: requests are matched and delivered, acks complete our own
//! operations, commands serialize counting-event work from application
//! threads. Triggered operations fire here and nowhere else.

use crate::ct::{CountingEvent, CtSink, CtValue, TriggeredAction};
use crate::handle::Handle;
use crate::header::{Command, MsgKind};
use crate::initiator::{self, OpRequest};
use crate::matching::Matcher;
use crate::ni::NiState;
use crate::offset::RelRef;
use crate::process::Shared;
use crate::types::NiKind;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Longest doorbell sleep; bounds the latency of a lost wakeup
const IDLE_SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DmState {
    Idle,
    Dispatching,
    HandlingAck,
    HandlingCommand,
    HandlingNewOperation,
    Stopped,
}

/// Counter increments made by the data-movement thread itself. Armed events
/// are remembered so their thresholds are checked once the message is done.
#[derive(Default)]
struct DmSink {
    touched: Vec<Arc<CountingEvent>>,
}

impl CtSink for DmSink {
    fn increment(&mut self, ct: &Arc<CountingEvent>, by: CtValue) {
        ct.inc(by);
        if ct.has_triggers() {
            self.touched.push(Arc::clone(ct));
        }
    }
}

struct DataMover {
    shared: Arc<Shared>,
    matcher: Matcher,
    sink: DmSink,
    /// Triggered puts waiting for a free fragment
    deferred: VecDeque<Box<OpRequest>>,
    state: DmState,
}

/// Thread body; returns after the `Terminate` sentinel.
pub(crate) fn run(shared: Arc<Shared>) {
    let rank = shared.rank();
    tracing::info!(rank, "data-movement thread started");
    let mut dm = DataMover {
        shared,
        matcher: Matcher::new(),
        sink: DmSink::default(),
        deferred: VecDeque::new(),
        state: DmState::Idle,
    };
    dm.run();
    tracing::info!(
        rank,
        pending_transfers = dm.matcher.pending(),
        deferred = dm.deferred.len(),
        "data-movement thread stopped"
    );
}

impl DataMover {
    fn run(&mut self) {
        let shared = Arc::clone(&self.shared);
        let rank = shared.rank();
        let recv = shared.segment.recv_queue(rank);
        let acks = shared.segment.ack_queue(rank);
        let bell = shared.segment.doorbell(rank);

        while self.state != DmState::Stopped {
            self.state = DmState::Dispatching;
            let mut worked = false;

            // Acks free fragments, so they go first
            while let Some(frag) = acks.dequeue() {
                self.state = DmState::HandlingAck;
                initiator::complete(&shared, frag, &mut self.sink);
                self.settle();
                worked = true;
            }
            if let Some(frag) = recv.dequeue() {
                self.dispatch(frag);
                self.settle();
                worked = true;
            }
            if !self.deferred.is_empty() {
                self.settle();
            }

            if worked {
                bell.satisfied();
                continue;
            }
            if self.state == DmState::Stopped {
                break;
            }
            self.state = DmState::Idle;
            match bell.frustrated() {
                Some(token) => {
                    if recv.has_pending() || acks.has_pending() {
                        continue;
                    }
                    bell.sleep(token, IDLE_SLEEP);
                }
                None => std::hint::spin_loop(),
            }
        }
    }

    fn dispatch(&mut self, frag: RelRef) {
        // Safety: dequeued from our receive queue; we own it until we pass it on
        let mut view = unsafe { self.shared.segment.fragment(frag) };
        match view.header().kind() {
            Some(MsgKind::Request) => {
                self.state = DmState::HandlingNewOperation;
                let (hdr, data) = view.split_mut();
                let ni = NiKind::from_u8(hdr.ni).and_then(|kind| self.shared.ni(kind));
                self.matcher.request(ni.as_deref(), hdr, data, &mut self.sink);
                hdr.kind = MsgKind::Ack as u8;
                self.shared.segment.send_ack(frag.owner(), frag);
            }
            Some(MsgKind::Command) => {
                self.state = DmState::HandlingCommand;
                let code = view.header().command;
                let command = Command::decode(view.header());
                self.shared.segment.pool(self.shared.rank()).free(frag);
                match command {
                    Some(command) => self.command(command),
                    None => tracing::warn!(code, "unknown command ignored"),
                }
            }
            Some(MsgKind::Terminate) => {
                self.shared.segment.pool(self.shared.rank()).free(frag);
                self.state = DmState::Stopped;
            }
            Some(MsgKind::Ack) | None => {
                let kind = view.header().kind;
                tracing::error!(?frag, kind, "foreign fragment on receive queue");
                crate::error::fatal("corrupt receive queue");
            }
        }
    }

    fn ni_of(&self, handle: Handle) -> Option<Arc<NiState>> {
        NiKind::from_u8(handle.ni()).and_then(|kind| self.shared.ni(kind))
    }

    fn counting_event(&self, raw: u64) -> Option<Arc<CountingEvent>> {
        let handle = Handle::from_raw(raw);
        self.ni_of(handle)?.cts.get(handle).ok()
    }

    fn command(&mut self, command: Command) {
        tracing::debug!(?command, "command");
        match command {
            Command::CtFree { ct } => {
                let handle = Handle::from_raw(ct);
                if let Some(ni) = self.ni_of(handle) {
                    if let Err(e) = ni.cts.free(handle) {
                        tracing::debug!(error = %e, "counting event already gone");
                    }
                }
            }
            Command::CtTriggerCheck { ct } => {
                if let Some(event) = self.counting_event(ct) {
                    self.sink.touched.push(event);
                }
            }
            Command::CtUnorderedInc { ct, success, failure } => {
                if let Some(event) = self.counting_event(ct) {
                    self.sink.increment(&event, CtValue::new(success, failure));
                }
            }
        }
    }

    /// Fire ready triggered operations until nothing more becomes ready.
    fn settle(&mut self) {
        loop {
            while let Some(ct) = self.sink.touched.pop() {
                for action in ct.take_ready() {
                    if let Some(ni) = self.ni_of(ct.handle()) {
                        ni.triggered.fetch_sub(1, Ordering::AcqRel);
                    }
                    self.fire(action);
                }
            }
            self.start_deferred();
            if self.sink.touched.is_empty() {
                break;
            }
        }
    }

    fn fire(&mut self, action: TriggeredAction) {
        match action {
            TriggeredAction::CtInc { ct, by } => {
                tracing::debug!(ct = ?ct.handle(), ?by, "triggered increment");
                self.sink.increment(&ct, by);
            }
            TriggeredAction::CtSet { ct, to } => {
                tracing::debug!(ct = ?ct.handle(), ?to, "triggered set");
                ct.set(to);
                if ct.has_triggers() {
                    self.sink.touched.push(ct);
                }
            }
            TriggeredAction::Put(req) => self.deferred.push_back(req),
        }
    }

    /// Send deferred triggered puts while fragments are available.
    fn start_deferred(&mut self) {
        let shared = Arc::clone(&self.shared);
        let pool = shared.segment.pool(shared.rank());
        while let Some(req) = self.deferred.front() {
            let Some(ni) = shared.ni(req.ni) else {
                tracing::debug!(ni = ?req.ni, "triggered put for a finalized interface dropped");
                self.deferred.pop_front();
                continue;
            };
            let Some(frag) = pool.try_fetch(req.payload_size(&shared)) else {
                break;
            };
            if let Some(req) = self.deferred.pop_front() {
                initiator::start(&shared, &ni, &req, frag, &mut self.sink);
            }
        }
    }
}
