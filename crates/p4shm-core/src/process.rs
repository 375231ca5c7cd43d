//! Per-rank process context
//!
//! [`Process::init`] attaches to the group's segment, carves this rank's
//! fragment slabs and starts the data-movement thread. Network interfaces
//! are created from it and share its state with that thread.

use crate::config::Config;
use crate::dm;
use crate::header::{Command, MsgHeader, MsgKind};
use crate::initiator;
use crate::ni::{Ni, NiState};
use crate::segment::Segment;
use crate::types::{NiKind, NiLimits};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::JoinHandle;

/// State shared between application threads and the data-movement thread
pub(crate) struct Shared {
    pub config: Config,
    pub segment: Segment,
    nis: [RwLock<Option<Arc<NiState>>>; 4],
}

impl Shared {
    pub fn rank(&self) -> u32 {
        self.config.rank
    }

    pub fn ni(&self, kind: NiKind) -> Option<Arc<NiState>> {
        self.nis[kind.index()].read().clone()
    }

    pub fn remove_ni(&self, kind: NiKind) -> Result<()> {
        self.nis[kind.index()]
            .write()
            .take()
            .map(|_| ())
            .ok_or(Error::NotInitialized)
    }

    /// Inline data bytes of a large fragment
    pub fn large_capacity(&self) -> usize {
        initiator::large_capacity(self.segment.layout())
    }

    fn send_local(&self, fill: impl FnOnce(&mut MsgHeader)) {
        let rank = self.rank();
        let frag = self.segment.pool(rank).fetch(MsgHeader::SIZE);
        {
            // Safety: freshly fetched from our own pad
            let mut view = unsafe { self.segment.fragment(frag) };
            let hdr = view.header_mut();
            *hdr = MsgHeader {
                src: rank,
                target: rank,
                ..MsgHeader::default()
            };
            fill(hdr);
        }
        self.segment.send_request(rank, frag);
    }

    /// Queue `command` for our own data-movement thread.
    pub fn send_command(&self, command: Command) {
        tracing::debug!(?command, "queueing command");
        self.send_local(|hdr| command.encode(hdr));
    }
}

/// One rank of a process group
pub struct Process {
    shared: Arc<Shared>,
    dm: Option<JoinHandle<()>>,
}

impl Process {
    /// Attach to the group's segment and start the data-movement thread.
    ///
    /// At most one `Process` may exist per rank at a time.
    pub fn init(config: Config) -> Result<Self> {
        let segment = Segment::attach(&config)?;
        segment.pool(config.rank).setup();
        let rank = config.rank;
        let shared = Arc::new(Shared {
            config,
            segment,
            nis: Default::default(),
        });
        let dm = std::thread::Builder::new()
            .name(format!("p4shm-dm-{rank}"))
            .spawn({
                let shared = Arc::clone(&shared);
                move || dm::run(shared)
            })?;
        tracing::info!(rank, num_procs = shared.config.num_procs, "process initialized");
        Ok(Self {
            shared,
            dm: Some(dm),
        })
    }

    pub fn rank(&self) -> u32 {
        self.shared.rank()
    }

    pub fn num_procs(&self) -> u32 {
        self.shared.config.num_procs
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Initialize the interface of `kind`, or return the existing one.
    /// `limits` defaults to the configured limits.
    pub fn ni_init(&self, kind: NiKind, limits: Option<NiLimits>) -> Result<Ni> {
        let mut slot = self.shared.nis[kind.index()].write();
        if let Some(state) = slot.as_ref() {
            return Ok(Ni::new(Arc::clone(&self.shared), Arc::clone(state)));
        }
        let limits = limits.unwrap_or(self.shared.config.ni_limits);
        if limits.max_pt_index == u32::MAX {
            return Err(Error::InvalidArgument("max_pt_index too large".to_string()));
        }
        let state = Arc::new(NiState::new(kind, &self.shared.config, limits));
        *slot = Some(Arc::clone(&state));
        tracing::info!(rank = self.rank(), ?kind, "network interface initialized");
        Ok(Ni::new(Arc::clone(&self.shared), state))
    }

    /// Stop the data-movement thread and tear down every interface.
    pub fn fini(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(dm) = self.dm.take() else {
            return Ok(());
        };
        self.shared
            .send_local(|hdr| hdr.kind = MsgKind::Terminate as u8);
        if dm.join().is_err() {
            tracing::error!(rank = self.rank(), "data-movement thread panicked");
            return Err(Error::Interrupted);
        }
        for kind in NiKind::ALL {
            if let Some(ni) = self.shared.nis[kind.index()].write().take() {
                ni.retire();
            }
        }
        tracing::info!(rank = self.rank(), "process finalized");
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "process teardown failed");
        }
    }
}
