//! The shared communication segment
//!
//! Created once per process group (the launcher's job) and attached by every
//! rank. Each rank sees the segment at its own address; everything stored
//! inside is pad-relative.

use crate::config::Config;
use crate::doorbell::Doorbell;
use crate::fragment::{FragView, FragmentPool};
use crate::layout::{PadLayout, SEGMENT_HEADER_SIZE};
use crate::offset::{BaseTable, RelRef};
use crate::queue::{Queue, QueueHeader};
use crate::shm::SharedMemory;
use crate::{Error, Result};

const MAGIC: u64 = 0x4745_534D_4853_3450; // "P4SHMSEG"
const VERSION: u32 = 1;

/// Header at offset 0 of the segment
#[repr(C, align(64))]
struct SegmentHeader {
    magic: u64,
    version: u32,
    num_procs: u32,
    small_frag_size: u64,
    large_frag_size: u64,
    small_frag_count: u32,
    large_frag_count: u32,
    pad_size: u64,
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == SEGMENT_HEADER_SIZE);

/// Receive block at pad offset 0
#[repr(C)]
struct RecvBlock {
    queue: QueueHeader,
    bell: Doorbell,
}

const _: () = assert!(std::mem::size_of::<RecvBlock>() == crate::layout::RECV_BLOCK_SIZE);

/// One process's mapping of the segment
pub struct Segment {
    shm: SharedMemory,
    layout: PadLayout,
    num_procs: u32,
    bases: BaseTable,
}

impl Segment {
    /// Create and initialize the segment for a whole group.
    pub fn create(config: &Config) -> Result<Self> {
        config.validate()?;
        let layout = config.pad_layout();
        let size = layout.segment_size(config.num_procs);
        let shm = SharedMemory::create(&config.shm_name, size)?;

        // Safety: fresh mapping, nobody else attached yet
        unsafe {
            std::ptr::write(
                shm.base() as *mut SegmentHeader,
                SegmentHeader {
                    magic: MAGIC,
                    version: VERSION,
                    num_procs: config.num_procs,
                    small_frag_size: config.small_frag_size as u64,
                    large_frag_size: config.large_frag_size as u64,
                    small_frag_count: config.small_frag_count,
                    large_frag_count: config.large_frag_count,
                    pad_size: layout.pad_size() as u64,
                },
            );
        }

        let segment = Self::from_shm(shm, layout, config.num_procs);
        for rank in 0..config.num_procs {
            segment.recv_queue(rank).init();
            segment.ack_queue(rank).init();
            segment.doorbell(rank).init(config.frustration_threshold);
        }
        tracing::info!(
            name = %config.shm_name,
            size,
            num_procs = config.num_procs,
            pad_size = layout.pad_size(),
            "segment created"
        );
        Ok(segment)
    }

    /// Attach to a segment created by the launcher.
    pub fn attach(config: &Config) -> Result<Self> {
        config.validate()?;
        let shm = SharedMemory::open(&config.shm_name)?;
        if shm.size() < SEGMENT_HEADER_SIZE {
            return Err(Error::SegmentMismatch("segment too small".to_string()));
        }

        // Validate header
        let header = unsafe { &*(shm.base() as *const SegmentHeader) };
        if header.magic != MAGIC {
            return Err(Error::SegmentMismatch("invalid magic number".to_string()));
        }
        if header.version != VERSION {
            return Err(Error::SegmentMismatch(format!(
                "version mismatch: expected {}, got {}",
                VERSION, header.version
            )));
        }
        let layout = config.pad_layout();
        if header.num_procs != config.num_procs
            || header.small_frag_size != config.small_frag_size as u64
            || header.large_frag_size != config.large_frag_size as u64
            || header.small_frag_count != config.small_frag_count
            || header.large_frag_count != config.large_frag_count
            || header.pad_size != layout.pad_size() as u64
        {
            return Err(Error::SegmentMismatch(
                "segment geometry differs from configuration".to_string(),
            ));
        }
        if shm.size() < layout.segment_size(config.num_procs) {
            return Err(Error::SegmentMismatch("segment truncated".to_string()));
        }

        tracing::info!(name = %config.shm_name, rank = config.rank, "segment attached");
        Ok(Self::from_shm(shm, layout, config.num_procs))
    }

    fn from_shm(shm: SharedMemory, layout: PadLayout, num_procs: u32) -> Self {
        // Safety: the mapping is owned by the same struct as the table
        let bases = unsafe {
            BaseTable::new(shm.base(), SEGMENT_HEADER_SIZE, layout.pad_size(), num_procs)
        };
        Self {
            shm,
            layout,
            num_procs,
            bases,
        }
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    pub fn layout(&self) -> &PadLayout {
        &self.layout
    }

    pub fn num_procs(&self) -> u32 {
        self.num_procs
    }

    pub fn bases(&self) -> &BaseTable {
        &self.bases
    }

    fn recv_block(&self, rank: u32) -> &RecvBlock {
        let pad = self.bases.pad_base(rank);
        // Safety: offset 0 of every pad holds a RecvBlock
        unsafe { &*(pad.add(self.layout.recv_queue_offset()) as *const RecvBlock) }
    }

    /// Receive queue of `rank`
    pub fn recv_queue(&self, rank: u32) -> Queue<'_> {
        let block = self.recv_block(rank);
        // Safety: only fragment references are ever enqueued
        unsafe { Queue::new(&block.queue, &self.bases) }
    }

    /// Ack queue of `rank`
    pub fn ack_queue(&self, rank: u32) -> Queue<'_> {
        let pad = self.bases.pad_base(rank);
        // Safety: as above; the ack block sits at a fixed pad offset
        unsafe {
            let hdr = &*(pad.add(self.layout.ack_queue_offset()) as *const QueueHeader);
            Queue::new(hdr, &self.bases)
        }
    }

    /// Wakeup bell shared by both queues of `rank`
    pub fn doorbell(&self, rank: u32) -> &Doorbell {
        &self.recv_block(rank).bell
    }

    /// Fragment allocator of the pad owned by `rank`
    pub fn pool(&self, rank: u32) -> FragmentPool<'_> {
        // Safety: pad geometry comes from the validated layout
        unsafe { FragmentPool::new(self.bases.pad_base(rank), rank, self.layout) }
    }

    /// Enqueue on `rank`'s receive queue and wake its consumer
    pub fn send_request(&self, rank: u32, frag: RelRef) {
        self.recv_queue(rank).enqueue(frag);
        self.doorbell(rank).ring();
    }

    /// Enqueue on `rank`'s ack queue and wake its consumer
    pub fn send_ack(&self, rank: u32, frag: RelRef) {
        self.ack_queue(rank).enqueue(frag);
        self.doorbell(rank).ring();
    }

    /// View a fragment this process currently owns.
    ///
    /// # Safety
    /// The caller must exclusively own `frag` (fetched and not yet enqueued,
    /// or dequeued and not yet re-enqueued or freed) while the view lives.
    pub unsafe fn fragment(&self, frag: RelRef) -> FragView<'_> {
        FragView::new(frag, self.bases.resolve(frag), &self.layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SizeClass;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/p4shm_seg_{}_{}_{}", tag, std::process::id(), ts)
    }

    fn config(name: &str) -> Config {
        Config::new()
            .with_shm_name(name)
            .with_num_procs(2)
            .with_small_frags(512, 8)
            .with_large_frags(4096, 2)
    }

    #[test]
    fn test_attach_validates_geometry() {
        let name = unique_name("geom");
        let _owner = Segment::create(&config(&name)).unwrap();
        Segment::attach(&config(&name).with_rank(1)).unwrap();
        let bad = config(&name).with_small_frags(256, 8);
        assert!(matches!(
            Segment::attach(&bad),
            Err(Error::SegmentMismatch(_))
        ));
    }

    #[test]
    fn test_cross_mapping_fragment_travel() {
        let name = unique_name("travel");
        let _owner = Segment::create(&config(&name)).unwrap();
        let rank0 = Segment::attach(&config(&name)).unwrap();
        let rank1 = Segment::attach(&config(&name).with_rank(1)).unwrap();
        rank0.pool(0).setup();

        // Rank 0 fills a fragment from its own pad and sends it to rank 1
        let frag = rank0.pool(0).fetch(64);
        {
            let mut view = unsafe { rank0.fragment(frag) };
            view.header_mut().length = 4;
            view.data_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        }
        rank0.send_request(1, frag);

        // Rank 1 sees it through a different mapping
        let got = rank1.recv_queue(1).dequeue().unwrap();
        assert_eq!(got, frag);
        {
            let view = unsafe { rank1.fragment(got) };
            assert_eq!(view.class(), SizeClass::Small);
            assert_eq!(view.header().length, 4);
            assert_eq!(&view.data()[..4], &[1, 2, 3, 4]);
        }
        rank1.send_ack(0, got);

        let back = rank0.ack_queue(0).dequeue().unwrap();
        rank0.pool(0).free(back);
        assert_eq!(rank0.pool(0).available(SizeClass::Small), 8);
    }
}
